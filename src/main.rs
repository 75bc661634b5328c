//! Demo simulating a UI that opens and closes a shop window repeatedly
//!
//! Run with `RUST_LOG=debug` to watch loads, holds and releases. An optional
//! first argument names a RON config file.

use std::time::{Duration, Instant};

use asset_cache::prelude::*;

/// Simulated frame length
const FRAME: Duration = Duration::from_millis(100);

/// Frames to simulate (30 seconds)
const FRAMES: u32 = 300;

/// Textures the shop window needs
const SHOP_TEXTURES: [&str; 3] = ["shop/background", "shop/coin", "shop/frame"];

fn load_config() -> CacheConfig {
    let Some(path) = std::env::args().nth(1) else {
        return CacheConfig::default();
    };
    match CacheConfig::load_ron(&path) {
        Ok(config) => {
            log::info!("Loaded config from {path}");
            config
        }
        Err(e) => {
            log::warn!("Using default config, {path}: {e}");
            CacheConfig::default()
        }
    }
}

fn open_shop(cache: &AssetCache<MemoryBackend>, opened: u32) -> ConsumerId {
    let shop = cache.register_consumer();
    cache.on_consumer_destroyed(shop, move || log::info!("Shop window #{opened} closed"));

    for path in SHOP_TEXTURES {
        let key = AssetKey::new("ui", path, "Texture");
        let served = cache.request_queued(&key, shop, move |asset| match asset {
            Some(texture) => log::info!("Shop #{opened} shows '{}'", texture.payload()),
            None => log::warn!("Shop #{opened} is missing a texture"),
        });
        if served {
            log::debug!("'{key}' served from cache");
        }
    }
    shop
}

fn main() {
    env_logger::init();

    let backend = MemoryBackend::new();
    backend.add_bundle("ui", false);
    for path in SHOP_TEXTURES {
        backend.add_asset("ui", path, "Texture", path);
    }
    backend.add_asset("resources", "icon", "Texture", "app icon");

    let cache = AssetCache::new(backend.clone(), load_config());
    let start = Instant::now();

    let hud = cache.register_consumer();
    cache.request_uri("icon", "Texture", hud, |asset| {
        if let Some(icon) = asset {
            log::info!("HUD shows '{}'", icon.payload());
        }
    });
    cache.request_uri("resources://badge", "Texture", hud, |asset| {
        if asset.is_none() {
            log::warn!("HUD badge unavailable, hiding it");
        }
    });

    let mut shop: Option<ConsumerId> = None;
    let mut opened = 0;

    for frame in 0..FRAMES {
        let now = start + FRAME * frame;

        // Toggle the shop every two seconds for the first twelve
        if frame % 20 == 0 && frame < 120 {
            match shop.take() {
                Some(window) => {
                    cache.destroy_consumer_at(window, now);
                }
                None => {
                    opened += 1;
                    shop = Some(open_shop(&cache, opened));
                }
            }
        }

        backend.pump();
        cache.update(now);

        if frame % 50 == 0 {
            log::info!("[{:>4.1}s] {}", (now - start).as_secs_f32(), cache.stats());
        }
    }

    log::info!("Loads issued: {}", backend.asset_loads());
    log::info!("Final: {}", cache.stats());
}
