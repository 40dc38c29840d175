fn main() {
    // Контекст Tauri нужен только десктопной сборке
    #[cfg(feature = "desktop")]
    tauri_build::build();
}
