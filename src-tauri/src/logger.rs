use crate::peer::ice::candidate_kind;
use crate::peer::types::IceCandidate;
use tracing::debug;
use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};

/// Формат временных меток в логах
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Логирование с временными метками.
///
/// Honors `config::LOGGING_ENABLED`; in release builds an explicit `RUST_LOG`
/// still turns it on. Calling it twice is harmless.
pub fn init() {
    let forced = std::env::var_os("RUST_LOG").is_some();
    if !crate::config::LOGGING_ENABLED && !forced {
        return;
    }

    #[cfg(debug_assertions)]
    {
        // В режиме разработки дополнительно проверяем dev::ENABLE_LOGGING
        if !crate::config::dev::ENABLE_LOGGING && !forced {
            return;
        }
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,webrtc=warn,webrtc_ice=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_owned()))
        .with_target(false)
        .try_init()
        .ok();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label} [{}]: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        candidate_kind(&cand.candidate),
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index
    );
}
