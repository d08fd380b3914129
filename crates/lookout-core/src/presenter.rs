//! Rendering of search results.

use crate::types::MatchResult;
use std::fmt;

/// A rendered [`MatchResult`]: one badge per timestamp plus the annotated
/// video reference, if the server produced one.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultView {
    pub badges: Vec<String>,
    pub video: Option<String>,
    pub summary: String,
}

/// Render a result. Timestamps keep the order the server reported them in.
pub fn present(result: &MatchResult) -> ResultView {
    let badges: Vec<String> = result.timestamps.iter().map(|&t| format_timestamp(t)).collect();
    let summary = match badges.len() {
        0 => "No appearances found".to_string(),
        1 => "Person appears at 1 timestamp".to_string(),
        n => format!("Person appears at {n} timestamps"),
    };
    ResultView {
        badges,
        video: result.video_url.clone(),
        summary,
    }
}

pub fn format_timestamp(seconds: f64) -> String {
    format!("{seconds:.2}s")
}

impl fmt::Display for ResultView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary)?;
        if !self.badges.is_empty() {
            writeln!(f, "  {}", self.badges.join("  "))?;
        }
        match &self.video {
            Some(url) => write!(f, "Annotated video: {url}"),
            None => write!(f, "No annotated video"),
        }
    }
}
