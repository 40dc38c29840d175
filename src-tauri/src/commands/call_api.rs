use crate::client::{CallClient, ClientEvent, Presence};
use crate::config::validate_ice_servers;
use crate::history::CallHistoryEntry;
use crate::peer::types::ServerConfig;
use crate::peer::WebRtcPeer;
use crate::session::SessionSnapshot;
use crate::signaling::UserInfo;
use std::sync::Arc;
use tauri::{command, AppHandle, Emitter, State};
use tracing::{debug, info, warn};

/// Всё, что нужно командам окна звонка
pub struct AppState {
    pub client: CallClient,
    pub presence: Presence,
    pub peer: Arc<WebRtcPeer>,
}

#[command]
pub async fn start_call(
    state: State<'_, AppState>,
    callee_id: String,
    callee_name: Option<String>,
) -> Result<(), String> {
    info!("start_call called: {callee_id}");
    state
        .client
        .start_call(&callee_id, callee_name.as_deref())
        .await
        .map_err(|e| e.to_string())
}

#[command]
pub async fn accept_call(state: State<'_, AppState>) -> Result<(), String> {
    state.client.accept().await.map_err(|e| e.to_string())
}

#[command]
pub async fn reject_call(state: State<'_, AppState>) -> Result<(), String> {
    state.client.reject().await.map_err(|e| e.to_string())
}

#[command]
pub async fn hang_up(state: State<'_, AppState>) -> Result<(), String> {
    state.client.hang_up().await.map_err(|e| e.to_string())
}

#[command]
pub fn call_state(state: State<'_, AppState>) -> SessionSnapshot {
    state.client.snapshot()
}

#[command]
pub async fn toggle_mute(state: State<'_, AppState>) -> Result<(), String> {
    state.client.toggle_mute().await.map_err(|e| e.to_string())
}

#[command]
pub async fn toggle_camera(state: State<'_, AppState>) -> Result<(), String> {
    state.client.toggle_camera().await.map_err(|e| e.to_string())
}

/// Сообщение от страницы через IPC (direct delivery)
#[command]
pub fn shim_message(state: State<'_, AppState>, url: String) {
    state.client.ingress().on_web_message(&url);
}

#[command]
pub async fn get_online_users(state: State<'_, AppState>) -> Result<Vec<UserInfo>, String> {
    if let Err(e) = state.presence.refresh().await {
        warn!("presence refresh failed, serving cached list: {e}");
    }
    Ok(state.presence.online())
}

#[command]
pub fn get_history(state: State<'_, AppState>) -> Vec<CallHistoryEntry> {
    state.client.history()
}

/// Устанавливает пользовательские ICE серверы, возвращает true при успехе, false при ошибке
#[command]
pub fn set_ice_servers(state: State<'_, AppState>, servers: Vec<ServerConfig>) -> bool {
    if let Err(e) = validate_ice_servers(&servers) {
        warn!("{e}");
        return false;
    }
    state.peer.set_ice_servers(servers);
    true
}

#[command]
pub fn get_ice_servers(state: State<'_, AppState>) -> Vec<ServerConfig> {
    state.peer.ice_servers()
}

/// Пересылает события клиента в webview
pub fn forward_events(app: AppHandle, client: &CallClient) {
    let mut rx = client.subscribe();
    tauri::async_runtime::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{n} client events lost before reaching the webview");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let sent = match &event {
                ClientEvent::State(s) => app.emit("call-state", s),
                ClientEvent::IncomingCall(request) => app.emit("incoming-call", request),
                ClientEvent::ConnectionLost => app.emit("call-error", "connection lost"),
                ClientEvent::Error(text) => app.emit("call-error", text),
            };
            match sent {
                Ok(()) => debug!("emitted {event:?}"),
                Err(e) => warn!("Failed to emit {event:?}: {e}"),
            }
        }
    });
}
