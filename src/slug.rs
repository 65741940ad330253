//! Project-name slugs used in object store paths.

/// Hard limit for slugs embedded in object paths.
const MAX_SLUG_LENGTH: usize = 48;

/// Convert a project name to a lowercase hyphen-separated ASCII slug.
pub fn slugify(name: &str) -> String {
    let lowered: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();

    // Collapse consecutive dashes and trim leading/trailing dashes
    let mut result = String::new();
    let mut prev_dash = true;
    for c in lowered.chars() {
        if c == '-' {
            if !prev_dash {
                result.push(c);
            }
            prev_dash = true;
        } else {
            result.push(c);
            prev_dash = false;
        }
    }

    if result.ends_with('-') {
        result.pop();
    }

    result
}

/// Slugify with truncation at a word boundary so object paths stay short.
pub fn slugify_truncate(name: &str) -> String {
    let mut result = slugify(name);

    if result.len() > MAX_SLUG_LENGTH {
        if let Some(pos) = result[..MAX_SLUG_LENGTH].rfind('-') {
            result.truncate(pos);
        } else {
            result.truncate(MAX_SLUG_LENGTH);
        }
    }

    if result.ends_with('-') {
        result.pop();
    }

    if result.is_empty() {
        result.push_str("project");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Flower Classifier"), "flower-classifier");
        assert_eq!(slugify("Cats vs. Dogs!"), "cats-vs-dogs");
        assert_eq!(slugify("  Multiple   Spaces  "), "multiple-spaces");
    }

    #[test]
    fn slugify_truncate_long_name() {
        let name = "A very long project name describing a fine-grained bird species classifier";
        let slug = slugify_truncate(name);
        assert!(slug.len() <= MAX_SLUG_LENGTH);
        assert!(!slug.ends_with('-'));
        assert!(!slug.is_empty());
    }

    #[test]
    fn slugify_truncate_degenerate_name() {
        assert_eq!(slugify_truncate("!!!"), "project");
    }
}
