//! Library build identification and the capabilities derived from it.

use serde::{Deserialize, Serialize};

/// First library build that accepts a rank-5 `{kw, kh, ic/g, oc/g, g}` filter.
pub const GROUPED_FILTER_MIN_BUILD: u32 = 20160701;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryBuild {
    pub version: String,
    /// Build date as `YYYYMMDD`.
    pub build_date: u32,
}

impl LibraryBuild {
    pub fn new(version: impl Into<String>, build_date: u32) -> Self {
        LibraryBuild {
            version: version.into(),
            build_date,
        }
    }
}

/// Structural choices that depend on the library build, resolved once per executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Groups are expressed as a fifth filter dimension instead of folded into `oc`.
    pub grouped_filter_layout: bool,
    /// The backward-filter diff may be converted into the forward filter layout.
    pub filter_diff_adapter: bool,
}

impl Capabilities {
    pub fn detect(build: &LibraryBuild) -> Self {
        Capabilities {
            grouped_filter_layout: build.build_date >= GROUPED_FILTER_MIN_BUILD,
            filter_diff_adapter: build.build_date > GROUPED_FILTER_MIN_BUILD,
        }
    }

    /// Capabilities of builds predating both features.
    pub const fn legacy() -> Self {
        Capabilities {
            grouped_filter_layout: false,
            filter_diff_adapter: false,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            grouped_filter_layout: true,
            filter_diff_adapter: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_thresholds_follow_build_date() {
        let old = Capabilities::detect(&LibraryBuild::new("old", 20160601));
        assert_eq!(old, Capabilities::legacy());

        let boundary = Capabilities::detect(&LibraryBuild::new("boundary", 20160701));
        assert!(boundary.grouped_filter_layout);
        assert!(!boundary.filter_diff_adapter);

        let current = Capabilities::detect(&LibraryBuild::new("current", 20170425));
        assert_eq!(current, Capabilities::default());
    }
}
