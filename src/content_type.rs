//! MIME type to file extension table.
//!
//! Loaded once per run from the store. Two indexes are built independently,
//! one by MIME template and one by extension, and must describe the same set
//! of entries; a table whose indexes disagree is rejected at load time.

use std::collections::HashMap;

use serde::Serialize;
use sqlx::FromRow;
use thiserror::Error;
use tracing::debug;

/// Extension used for HTML pages.
pub const PAGE_EXTENSION: &str = "html";

/// One row of the content type table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct ContentTypeEntry {
    /// MIME template such as `text/html` or `image/*`.
    pub template: String,
    /// Extension without the leading dot.
    pub extension: String,
    /// Whether the content is textual.
    pub is_text: bool,
}

impl ContentTypeEntry {
    #[must_use]
    pub fn new(template: &str, extension: &str, is_text: bool) -> Self {
        Self {
            template: template.to_string(),
            extension: extension.to_string(),
            is_text,
        }
    }
}

/// Errors raised while building a [`ContentTypeTable`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContentTypeError {
    /// The same template appears twice with different extensions.
    #[error("content type '{template}' maps to both '{first}' and '{second}'")]
    ConflictingTemplate {
        template: String,
        first: String,
        second: String,
    },

    /// An entry has an empty template or extension.
    #[error("content type entry '{template}' -> '{extension}' is incomplete")]
    IncompleteEntry { template: String, extension: String },

    /// The template and extension indexes do not agree.
    #[error("content type indexes disagree: {templates} templates vs {extensions} extension entries")]
    IndexMismatch { templates: usize, extensions: usize },
}

/// Immutable MIME lookup table.
#[derive(Debug, Clone, Default)]
pub struct ContentTypeTable {
    entries: Vec<ContentTypeEntry>,
    by_template: HashMap<String, usize>,
    by_extension: HashMap<String, Vec<usize>>,
}

impl ContentTypeTable {
    /// Builds and cross-checks the indexes.
    ///
    /// Exact duplicate rows collapse into one entry.
    ///
    /// # Errors
    ///
    /// Returns [`ContentTypeError`] when an entry is incomplete, a template is
    /// mapped to two extensions, or the two indexes disagree.
    pub fn from_entries(
        raw: impl IntoIterator<Item = ContentTypeEntry>,
    ) -> Result<Self, ContentTypeError> {
        let mut entries: Vec<ContentTypeEntry> = Vec::new();
        let mut by_template: HashMap<String, usize> = HashMap::new();

        for entry in raw {
            let template = entry.template.trim().to_ascii_lowercase();
            let extension = normalize_extension(&entry.extension);
            if template.is_empty() || extension.is_empty() {
                return Err(ContentTypeError::IncompleteEntry {
                    template: entry.template,
                    extension: entry.extension,
                });
            }
            if let Some(&index) = by_template.get(&template) {
                let existing = &entries[index];
                if existing.extension != extension {
                    return Err(ContentTypeError::ConflictingTemplate {
                        template,
                        first: existing.extension.clone(),
                        second: extension,
                    });
                }
                continue;
            }
            by_template.insert(template.clone(), entries.len());
            entries.push(ContentTypeEntry {
                template,
                extension,
                is_text: entry.is_text,
            });
        }

        let mut by_extension: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            by_extension
                .entry(entry.extension.clone())
                .or_default()
                .push(index);
        }

        let table = Self {
            entries,
            by_template,
            by_extension,
        };
        table.check_indexes()?;
        debug!(entries = table.entries.len(), "content type table loaded");
        Ok(table)
    }

    fn check_indexes(&self) -> Result<(), ContentTypeError> {
        let extension_entries: usize = self.by_extension.values().map(Vec::len).sum();
        let mismatch = || ContentTypeError::IndexMismatch {
            templates: self.by_template.len(),
            extensions: extension_entries,
        };
        if extension_entries != self.by_template.len() {
            return Err(mismatch());
        }
        for (template, &index) in &self.by_template {
            let entry = self.entries.get(index).ok_or_else(mismatch)?;
            let agrees = &entry.template == template
                && self
                    .by_extension
                    .get(&entry.extension)
                    .is_some_and(|indexes| indexes.contains(&index));
            if !agrees {
                return Err(mismatch());
            }
        }
        Ok(())
    }

    /// Extension for a `Content-Type` header value, parameters ignored.
    ///
    /// Exact templates win over `type/*` wildcards.
    #[must_use]
    pub fn extension_for_mime(&self, content_type: &str) -> Option<&str> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if mime.is_empty() {
            return None;
        }
        let index = self.by_template.get(&mime).or_else(|| {
            let major = mime.split('/').next()?;
            self.by_template.get(&format!("{major}/*"))
        })?;
        self.entries.get(*index).map(|entry| entry.extension.as_str())
    }

    /// First registered MIME template for an extension.
    #[must_use]
    pub fn mime_for_extension(&self, extension: &str) -> Option<&str> {
        let first = *self.by_extension.get(&normalize_extension(extension))?.first()?;
        self.entries.get(first).map(|entry| entry.template.as_str())
    }

    /// Whether any entry for the extension is textual.
    #[must_use]
    pub fn is_text_extension(&self, extension: &str) -> bool {
        self.by_extension
            .get(&normalize_extension(extension))
            .is_some_and(|indexes| {
                indexes
                    .iter()
                    .filter_map(|&index| self.entries.get(index))
                    .any(|entry| entry.is_text)
            })
    }

    /// Whether the extension is registered at all.
    #[must_use]
    pub fn knows_extension(&self, extension: &str) -> bool {
        self.by_extension.contains_key(&normalize_extension(extension))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether an extension denotes an HTML page.
#[must_use]
pub fn is_page_extension(extension: &str) -> bool {
    matches!(normalize_extension(extension).as_str(), PAGE_EXTENSION | "htm")
}

/// Lowercases and strips a leading dot.
#[must_use]
pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}
