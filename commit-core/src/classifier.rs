//! Phase classification (C1): a pure, allocation-light decision of whether an
//! item belongs in the phase-1 (immutable body) or phase-2 (mutable entry
//! point) write pass.

use std::path::Path;

use crate::config::Settings;
use crate::types::{CommitMode, Item};

pub struct ItemClassifier;

impl ItemClassifier {
    /// `Phase2` iff the basename is the autoindex filename, is in the
    /// configured entry-point set, or `web_uri` matches any `phase2_patterns`
    /// regex. Otherwise `Phase1`. No I/O, deterministic given `settings`.
    pub fn classify(item: &Item, settings: &Settings) -> CommitMode {
        let basename = Path::new(&item.web_uri)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&item.web_uri);

        if basename == settings.autoindex_filename {
            return CommitMode::Phase2;
        }
        if settings.entry_point_files.contains(basename) {
            return CommitMode::Phase2;
        }
        if settings
            .phase2_patterns
            .iter()
            .any(|re| re.is_match(&item.web_uri))
        {
            return CommitMode::Phase2;
        }
        CommitMode::Phase1
    }
}
