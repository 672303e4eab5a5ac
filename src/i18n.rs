use std::collections::HashMap;
use std::sync::OnceLock;

/// Global message catalog
static LOCALIZER: OnceLock<Localizer> = OnceLock::new();

fn localizer() -> &'static Localizer {
    LOCALIZER.get_or_init(Localizer::new)
}

/// Loads the catalog eagerly. Lookups initialize it lazily otherwise.
pub fn init() {
    let _ = localizer();
}

/// Get a message by key
pub fn t(key: &str) -> String {
    localizer().get(key)
}

/// Get a message by key with `{$name}` placeholders substituted
pub fn t_with_args(key: &str, args: &[(&str, &dyn std::fmt::Display)]) -> String {
    localizer().get_with_args(key, args)
}

#[derive(Debug)]
pub struct Localizer {
    messages: HashMap<String, String>,
}

impl Localizer {
    fn new() -> Self {
        Self {
            messages: Self::parse(include_str!("../locales/en.ftl")),
        }
    }

    fn parse(content: &str) -> HashMap<String, String> {
        let mut messages = HashMap::new();

        // Simple key = value format
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once(" = ") {
                messages.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        messages
    }

    fn get(&self, key: &str) -> String {
        self.messages.get(key).cloned().unwrap_or_else(|| {
            tracing::warn!("Missing message key: {key}");
            format!("MISSING: {key}")
        })
    }

    fn get_with_args(&self, key: &str, args: &[(&str, &dyn std::fmt::Display)]) -> String {
        let mut message = self.get(key);
        for (var_name, value) in args {
            let placeholder = format!("{{${var_name}}}");
            message = message.replace(&placeholder, &value.to_string());
        }
        message
    }
}

#[macro_export]
macro_rules! t {
    ($key:expr) => {
        $crate::i18n::t($key)
    };
}

#[macro_export]
macro_rules! t_args {
    ($key:expr, $($name:expr => $value:expr),*) => {{
        let args: &[(&str, &dyn std::fmt::Display)] = &[
            $(
                ($name, &$value),
            )*
        ];
        $crate::i18n::t_with_args($key, args)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_cli_about() {
        let localizer = Localizer::new();
        assert!(!localizer.get("cli-about").starts_with("MISSING"));
    }

    #[test]
    fn placeholders_are_substituted() {
        let localizer = Localizer {
            messages: Localizer::parse("greet = hello {$who}, {$n} times"),
        };
        let n = 3;
        let msg = localizer.get_with_args("greet", &[("who", &"world"), ("n", &n)]);
        assert_eq!(msg, "hello world, 3 times");
    }
}
