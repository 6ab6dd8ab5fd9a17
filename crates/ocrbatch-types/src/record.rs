//! Record identity: pages, books, and their filesystem locations.
//!
//! A [`RecordKey`] names a single page of a catalog book; a [`BookId`]
//! names the `(state, school, year)` chain the page belongs to. The
//! canonical wire form is `"state:school:year:page"`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Error produced when a record key cannot be parsed or constructed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordKeyError {
    /// The serialized key did not have exactly four `:`-separated parts.
    #[error("invalid record key `{0}`: expected state:school:year:page")]
    Malformed(String),

    /// A component that must be a positive integer was not.
    #[error("invalid record key `{key}`: {field} must be a positive integer")]
    BadNumber { key: String, field: &'static str },

    /// `state` or `school` was empty or contained a `:`.
    #[error("invalid record key component `{0}`: must be non-empty and colon-free")]
    BadComponent(String),
}

/// The `(state, school, year)` grouping that defines a dependency chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookId {
    pub state: String,
    pub school: String,
    pub year: u32,
}

impl std::fmt::Display for BookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.state, self.school, self.year)
    }
}

/// Globally unique identity of a single page.
///
/// Fields are private so every key in the system has passed the
/// component constraints; construct through [`RecordKey::new`] or
/// [`RecordKey::parse`]. Ordering is `(state, school, year, page)`,
/// which is also the stable order the scanner emits runnable keys in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    state: String,
    school: String,
    year: u32,
    page: u32,
}

impl RecordKey {
    /// Construct a key, validating the component constraints.
    ///
    /// # Errors
    ///
    /// Returns [`RecordKeyError`] if `state` or `school` is empty or
    /// contains a colon, or if `year`/`page` is zero.
    pub fn new(
        state: impl Into<String>,
        school: impl Into<String>,
        year: u32,
        page: u32,
    ) -> Result<Self, RecordKeyError> {
        let state = state.into();
        let school = school.into();
        for part in [&state, &school] {
            if part.is_empty() || part.contains(':') {
                return Err(RecordKeyError::BadComponent(part.clone()));
            }
        }
        if year == 0 || page == 0 {
            return Err(RecordKeyError::BadNumber {
                key: format!("{state}:{school}:{year}:{page}"),
                field: if year == 0 { "year" } else { "page" },
            });
        }
        Ok(Self {
            state,
            school,
            year,
            page,
        })
    }

    /// Parse the canonical `"state:school:year:page"` form.
    ///
    /// # Errors
    ///
    /// Returns [`RecordKeyError`] on a malformed key.
    pub fn parse(key: &str) -> Result<Self, RecordKeyError> {
        let parts: Vec<&str> = key.split(':').collect();
        let [state, school, year_str, page_str] = parts.as_slice() else {
            return Err(RecordKeyError::Malformed(key.to_string()));
        };
        let year: u32 = year_str.parse().map_err(|_| RecordKeyError::BadNumber {
            key: key.to_string(),
            field: "year",
        })?;
        let page: u32 = page_str.parse().map_err(|_| RecordKeyError::BadNumber {
            key: key.to_string(),
            field: "page",
        })?;
        Self::new(*state, *school, year, page)
    }

    /// State component.
    #[must_use]
    pub fn state(&self) -> &str {
        &self.state
    }

    /// School component.
    #[must_use]
    pub fn school(&self) -> &str {
        &self.school
    }

    /// Year component (always positive).
    #[must_use]
    pub fn year(&self) -> u32 {
        self.year
    }

    /// Page number within the book (always positive).
    #[must_use]
    pub fn page(&self) -> u32 {
        self.page
    }

    /// The book this page belongs to.
    #[must_use]
    pub fn book(&self) -> BookId {
        BookId {
            state: self.state.clone(),
            school: self.school.clone(),
            year: self.year,
        }
    }

    /// The key for another page of the same book.
    ///
    /// # Errors
    ///
    /// Returns [`RecordKeyError`] when `page` is zero.
    pub fn sibling(&self, page: u32) -> Result<Self, RecordKeyError> {
        Self::new(self.state.clone(), self.school.clone(), self.year, page)
    }

    /// Label file location under `label_root`.
    #[must_use]
    pub fn label_path(&self, label_root: &Path) -> PathBuf {
        self.page_path(label_root, "json")
    }

    /// Output file location under `output_root`. Its presence marks
    /// the page as Done.
    #[must_use]
    pub fn output_path(&self, output_root: &Path) -> PathBuf {
        self.page_path(output_root, "json")
    }

    /// Image asset location under `image_root`.
    #[must_use]
    pub fn image_path(&self, image_root: &Path) -> PathBuf {
        self.page_path(image_root, "jpg")
    }

    fn page_path(&self, root: &Path, ext: &str) -> PathBuf {
        root.join(&self.state)
            .join(&self.school)
            .join(self.year.to_string())
            .join(format!("{}.{ext}", self.page))
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.state, self.school, self.year, self.page
        )
    }
}

impl std::str::FromStr for RecordKey {
    type Err = RecordKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip() {
        let key = RecordKey::new("AL", "Howard", 1849, 3).unwrap();
        assert_eq!(key.to_string(), "AL:Howard:1849:3");
        let parsed = RecordKey::parse("AL:Howard:1849:3").unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn accessors_expose_components() {
        let key = RecordKey::new("CA", "Lincoln", 2023, 4).unwrap();
        assert_eq!(key.state(), "CA");
        assert_eq!(key.school(), "Lincoln");
        assert_eq!(key.year(), 2023);
        assert_eq!(key.page(), 4);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(matches!(
            RecordKey::parse("AL:Howard:1849"),
            Err(RecordKeyError::Malformed(_))
        ));
        assert!(matches!(
            RecordKey::parse("AL:Howard:184x:3"),
            Err(RecordKeyError::BadNumber { field: "year", .. })
        ));
        assert!(matches!(
            RecordKey::parse("AL:Howard:1849:p3"),
            Err(RecordKeyError::BadNumber { field: "page", .. })
        ));
    }

    #[test]
    fn new_rejects_empty_and_colon_components() {
        assert!(RecordKey::new("", "Howard", 1849, 1).is_err());
        assert!(RecordKey::new("AL", "How:ard", 1849, 1).is_err());
        assert!(RecordKey::new("AL", "Howard", 0, 1).is_err());
        assert!(RecordKey::new("AL", "Howard", 1849, 0).is_err());
    }

    #[test]
    fn parse_rejects_zero_year_and_page() {
        assert!(matches!(
            RecordKey::parse("AL:Howard:0:1"),
            Err(RecordKeyError::BadNumber { field: "year", .. })
        ));
        assert!(matches!(
            RecordKey::parse("AL:Howard:1849:0"),
            Err(RecordKeyError::BadNumber { field: "page", .. })
        ));
    }

    #[test]
    fn sibling_stays_in_book() {
        let key = RecordKey::new("AL", "Howard", 1849, 12).unwrap();
        let sibling = key.sibling(4).unwrap();
        assert_eq!(sibling.to_string(), "AL:Howard:1849:4");
        assert_eq!(sibling.book(), key.book());
        assert!(key.sibling(0).is_err());
    }

    #[test]
    fn paths_follow_layout() {
        let key = RecordKey::new("CA", "Lincoln", 2023, 4).unwrap();
        let root = Path::new("/data/labels");
        assert_eq!(
            key.label_path(root),
            Path::new("/data/labels/CA/Lincoln/2023/4.json")
        );
        assert_eq!(
            key.image_path(Path::new("/data/images")),
            Path::new("/data/images/CA/Lincoln/2023/4.jpg")
        );
    }

    #[test]
    fn ordering_is_state_school_year_page() {
        let mut keys = vec![
            RecordKey::new("CA", "B", 2023, 1).unwrap(),
            RecordKey::new("AL", "Z", 1849, 9).unwrap(),
            RecordKey::new("AL", "A", 1850, 2).unwrap(),
            RecordKey::new("AL", "A", 1850, 1).unwrap(),
        ];
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec!["AL:A:1850:1", "AL:A:1850:2", "AL:Z:1849:9", "CA:B:2023:1"]
        );
    }

    #[test]
    fn book_grouping() {
        let a = RecordKey::new("AL", "Howard", 1849, 1).unwrap();
        let b = RecordKey::new("AL", "Howard", 1849, 7).unwrap();
        assert_eq!(a.book(), b.book());
        assert_eq!(a.book().to_string(), "AL:Howard:1849");
    }
}
