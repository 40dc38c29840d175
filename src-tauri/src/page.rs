use std::io;
use std::path::Path;
use tracing::{debug, warn};

pub const CSS_MARKER: &str = "/*INLINE_CSS*/";
pub const JS_MARKER: &str = "/*INLINE_JS*/";

/// Собирает страницу звонка в одну строку (для webview, которым дают HTML, а не URL).
///
/// `index.html` is required. `webrtc.css` and `webrtc.js` are inlined at
/// their markers when present; a missing one is logged and its marker stays.
pub async fn load_call_page(dir: &Path) -> io::Result<String> {
    let mut html = tokio::fs::read_to_string(dir.join("index.html")).await?;
    for (file, marker) in [("webrtc.css", CSS_MARKER), ("webrtc.js", JS_MARKER)] {
        match tokio::fs::read_to_string(dir.join(file)).await {
            Ok(content) => {
                html = html.replace(marker, &content);
                debug!("inlined {file} ({} bytes)", content.len());
            }
            Err(e) => warn!("page asset {file} not inlined: {e}"),
        }
    }
    Ok(html)
}
