//! Message normalization.
//!
//! Collapses identifiers out of error messages so that "user_01H8X not
//! found" and "user_01H9Q not found" group together.

use regex::Regex;

pub struct Normalizer {
    email: Regex,
    user_id: Regex,
    org_id: Regex,
    uuid: Regex,
    number: Regex,
    whitespace: Regex,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        // Compiled once per analyzer, not per record.
        Self {
            email: Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")
                .expect("static regex"),
            user_id: Regex::new(r"\buser_[A-Za-z0-9]{6,}\b").expect("static regex"),
            org_id: Regex::new(r"\borg_[A-Za-z0-9]{6,}\b").expect("static regex"),
            uuid: Regex::new(
                r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
            )
            .expect("static regex"),
            number: Regex::new(r"\b\d{5,}\b").expect("static regex"),
            whitespace: Regex::new(r"\s+").expect("static regex"),
        }
    }

    /// Replace identifier-shaped tokens with placeholders and collapse
    /// whitespace.
    pub fn normalize(&self, message: &str) -> String {
        let out = self.email.replace_all(message, "<EMAIL>");
        let out = self.user_id.replace_all(&out, "<USER_ID>");
        let out = self.org_id.replace_all(&out, "<ORG_ID>");
        let out = self.uuid.replace_all(&out, "<UUID>");
        let out = self.number.replace_all(&out, "<NUMBER>");
        let out = self.whitespace.replace_all(&out, " ");
        out.trim().to_string()
    }
}
