//! Locale selection and message translation
//!
//! The chassis carries no message catalog. A pluggable translator `(locale, key, args)`
//! resolves message keys; the default one echoes the key with `{}` placeholders filled.

use std::fmt;
use std::sync::Arc;

/// Translator callback: `(locale, key, args) -> message`
pub type TranslateFn = Arc<dyn Fn(&str, &str, &[String]) -> String + Send + Sync>;

#[derive(Clone)]
pub struct I18n {
    languages: Vec<String>,
    translator: TranslateFn,
}

impl fmt::Debug for I18n {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I18n")
            .field("languages", &self.languages)
            .finish()
    }
}

impl Default for I18n {
    fn default() -> Self {
        Self::new(vec!["en".to_string()])
    }
}

fn echo(_locale: &str, key: &str, args: &[String]) -> String {
    args.iter()
        .fold(key.to_string(), |acc, arg| acc.replacen("{}", arg, 1))
}

fn normalize(tag: &str) -> String {
    tag.trim().replace('-', "_").to_lowercase()
}

impl I18n {
    /// Supported languages, the first being the fallback
    pub fn new(languages: Vec<String>) -> Self {
        let languages = if languages.is_empty() {
            vec!["en".to_string()]
        } else {
            languages
        };
        Self {
            languages,
            translator: Arc::new(echo),
        }
    }

    pub fn with_translator<F>(mut self, translator: F) -> Self
    where
        F: Fn(&str, &str, &[String]) -> String + Send + Sync + 'static,
    {
        self.translator = Arc::new(translator);
        self
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn default_language(&self) -> &str {
        &self.languages[0]
    }

    /// Pick the configured language best matching an `Accept-Language` header
    pub fn select(&self, accept_language: Option<&str>) -> String {
        let Some(header) = accept_language else {
            return self.default_language().to_string();
        };

        let mut ranges: Vec<(String, f32)> = header
            .split(',')
            .filter_map(|part| {
                let mut pieces = part.split(';');
                let tag = normalize(pieces.next()?);
                if tag.is_empty() {
                    return None;
                }
                let q = pieces
                    .find_map(|p| p.trim().strip_prefix("q="))
                    .and_then(|q| q.parse::<f32>().ok())
                    .unwrap_or(1.0);
                Some((tag, q))
            })
            .collect();
        ranges.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (tag, _) in &ranges {
            if let Some(exact) = self.languages.iter().find(|l| normalize(l) == *tag) {
                return exact.clone();
            }
            let primary = tag.split('_').next().unwrap_or(tag);
            if let Some(partial) = self
                .languages
                .iter()
                .find(|l| normalize(l).split('_').next() == Some(primary))
            {
                return partial.clone();
            }
        }
        self.default_language().to_string()
    }

    pub fn translate(&self, locale: &str, key: &str, args: &[String]) -> String {
        (self.translator)(locale, key, args)
    }
}
