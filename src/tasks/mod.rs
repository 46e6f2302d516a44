//! Task bodies run by the translation and analysis workers.

pub mod analyse;
pub mod translate;

pub use analyse::AnalyseHandler;
pub use translate::TranslateHandler;

const PREVIEW_CHARS: usize = 80;

/// First line of a message, shortened for log output.
fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut shortened: String = line.chars().take(PREVIEW_CHARS).collect();
    if shortened.len() < text.len() {
        shortened.push_str("...");
    }
    shortened
}
