/// Maximum number of undo groups kept before the oldest is evicted.
pub const DEFAULT_GROUP_LIMIT: i64 = 500;

/// Tables of the show schema that are tracked by default.
///
/// Derived caches and the log tables themselves are deliberately absent.
pub const DEFAULT_TRACKED_TABLES: [&str; 17] = [
    "beats",
    "measures",
    "pages",
    "marchers",
    "marcher_pages",
    "midsets",
    "pathways",
    "props",
    "prop_page_geometry",
    "field_properties",
    "shapes",
    "shape_pages",
    "shape_page_marchers",
    "section_appearances",
    "tags",
    "tag_appearances",
    "marcher_tags",
];

/// Configuration for the history system.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Max undo groups retained (`<= 0` = unbounded).
    pub group_limit: i64,
    /// Tables that receive history triggers at startup.
    pub tracked_tables: Vec<String>,
    /// Whether foreign keys are enforced outside of undo/redo replay.
    pub enforce_foreign_keys: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            group_limit: DEFAULT_GROUP_LIMIT,
            tracked_tables: DEFAULT_TRACKED_TABLES.iter().map(|t| t.to_string()).collect(),
            enforce_foreign_keys: true,
        }
    }
}
