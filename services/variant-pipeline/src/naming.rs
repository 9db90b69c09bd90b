//! Object key decomposition and derivative naming.
//!
//! Layout of derivatives in the destination bucket:
//! `{root_prefix}/{label}/{label}-{base_filename}.{ext}`

/// A slash-delimited object key split into its filename parts.
///
/// Derivation is positional: only the last path segment matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey<'a> {
    key: &'a str,
    filename: &'a str,
}

impl<'a> ObjectKey<'a> {
    pub fn new(key: &'a str) -> Self {
        let filename = key.rsplit('/').next().unwrap_or(key);
        Self { key, filename }
    }

    /// Full key as received
    pub fn as_str(&self) -> &'a str {
        self.key
    }

    /// Last path segment, extension included
    pub fn filename_with_extension(&self) -> &'a str {
        self.filename
    }

    /// Last path segment with its final extension removed
    pub fn base_filename(&self) -> &'a str {
        match self.filename.rfind('.') {
            Some(dot) => &self.filename[..dot],
            None => self.filename,
        }
    }

    /// Text after the final `.` of the last segment
    pub fn extension(&self) -> Option<&'a str> {
        self.filename
            .rfind('.')
            .map(|dot| &self.filename[dot + 1..])
    }
}

/// Filename of a derivative: `{label}-{base_filename}.{ext}`
pub fn derivative_filename(label: &str, base_filename: &str, ext: &str) -> String {
    if ext.is_empty() {
        format!("{label}-{base_filename}")
    } else {
        format!("{label}-{base_filename}.{ext}")
    }
}

/// Destination key of a derivative: `{root_prefix}/{label}/{filename}`
pub fn destination_key(root_prefix: &str, label: &str, filename: &str) -> String {
    format!(
        "{root}/{label}/{filename}",
        root = root_prefix.trim_end_matches('/'),
        label = label,
        filename = filename
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_parts() {
        let key = ObjectKey::new("places/original/IMG01.jpg");
        assert_eq!(key.filename_with_extension(), "IMG01.jpg");
        assert_eq!(key.base_filename(), "IMG01");
        assert_eq!(key.extension(), Some("jpg"));
    }

    #[test]
    fn test_parts_independent_of_depth() {
        for key in ["IMG01.jpg", "a/IMG01.jpg", "a/b/c/d/IMG01.jpg"] {
            let key = ObjectKey::new(key);
            assert_eq!(key.filename_with_extension(), "IMG01.jpg");
            assert_eq!(key.base_filename(), "IMG01");
        }
    }

    #[test]
    fn test_only_final_extension_removed() {
        let key = ObjectKey::new("avatars/original/archive.tar.PNG");
        assert_eq!(key.base_filename(), "archive.tar");
        assert_eq!(key.extension(), Some("PNG"));
    }

    #[test]
    fn test_no_extension() {
        let key = ObjectKey::new("places/original/README");
        assert_eq!(key.base_filename(), "README");
        assert_eq!(key.extension(), None);
    }

    #[test]
    fn test_destination_key_layout() {
        let filename = derivative_filename("small", "IMG01", "jpeg");
        assert_eq!(filename, "small-IMG01.jpeg");
        assert_eq!(
            destination_key("places", "small", &filename),
            "places/small/small-IMG01.jpeg"
        );
        assert_eq!(
            destination_key("avatars/", "thumbnail", "thumbnail-foo.jpeg"),
            "avatars/thumbnail/thumbnail-foo.jpeg"
        );
    }
}
