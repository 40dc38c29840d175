pub mod bridge;
pub mod call;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod logger;
pub mod page;
pub mod peer;
pub mod ringback;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(feature = "desktop")]
mod commands;

pub use bridge::{BridgeEvent, BridgeIngress, NavigationDecision, NegotiationBridge};
pub use call::{CallEngine, EngineEvent};
pub use client::{CallClient, ClientEvent, Presence};
pub use config::{CallConfig, DeliveryMode};
pub use error::{BridgeError, CallError, ConfigError, PeerError, SignalingError};
pub use session::{CallState, Direction};

#[cfg(feature = "desktop")]
use std::sync::Arc;

/// Десктопное окно звонка поверх любого сигнального канала.
#[cfg(feature = "desktop")]
pub fn run_with(signaling: Arc<dyn signaling::SignalingChannel>, config: CallConfig) {
    use commands::call_api;
    use tauri::{Manager, WebviewUrl, WebviewWindowBuilder};

    logger::init();

    tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .setup(move |app| {
            let peer = Arc::new(peer::WebRtcPeer::new(config.ice_servers.clone()));
            let (client, presence) = tauri::async_runtime::block_on(async {
                let client = CallClient::new(signaling.clone(), peer.clone(), &config);
                let presence = Presence::start(signaling.clone()).await;
                (client, presence)
            });
            let presence = presence?;

            let ingress = client.ingress();
            WebviewWindowBuilder::new(app, "main", WebviewUrl::App("index.html".into()))
                .title("VisioCall")
                .inner_size(960.0, 640.0)
                .on_navigation(move |url| {
                    ingress.on_navigating(url.as_str()) == NavigationDecision::Allow
                })
                .build()?;

            commands::forward_events(app.handle().clone(), &client);
            app.manage(commands::AppState {
                client,
                presence,
                peer,
            });
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            call_api::start_call,
            call_api::accept_call,
            call_api::reject_call,
            call_api::hang_up,
            call_api::call_state,
            call_api::toggle_mute,
            call_api::toggle_camera,
            call_api::shim_message,
            call_api::get_online_users,
            call_api::get_history,
            call_api::set_ice_servers,
            call_api::get_ice_servers,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}

/// Standalone entry: local user on an in-process hub (`VISIOCALL_USER`).
#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let user = std::env::var("VISIOCALL_USER").unwrap_or_else(|_| "me".into());
    let hub = signaling::memory::MemoryHub::new();
    run_with(hub.connect(&user, &user), CallConfig::from_env());
}
