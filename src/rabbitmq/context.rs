// src/rabbitmq/context.rs

/// Which named connection the next publish goes to.
///
/// `select` overrides the default until the next publish-family call
/// `release`s it; the release happens before that call does any work, so an
/// error part-way through never leaves the override in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    default: String,
    overridden: Option<String>,
}

impl ConnectionContext {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            overridden: None,
        }
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn active(&self) -> &str {
        self.overridden.as_deref().unwrap_or(&self.default)
    }

    pub fn is_overridden(&self) -> bool {
        self.overridden.is_some()
    }

    pub fn select(&mut self, name: &str) {
        if name == self.default {
            self.overridden = None;
        } else {
            self.overridden = Some(name.to_string());
        }
    }

    /// Returns the active name and goes back to the default.
    pub fn release(&mut self) -> String {
        self.overridden
            .take()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_on_default() {
        let context = ConnectionContext::new("rabbitmq");
        assert_eq!(context.active(), "rabbitmq");
        assert!(!context.is_overridden());
    }

    #[test]
    fn release_reverts_override() {
        let mut context = ConnectionContext::new("rabbitmq");
        context.select("reporting");
        assert_eq!(context.active(), "reporting");

        assert_eq!(context.release(), "reporting");
        assert_eq!(context.active(), "rabbitmq");
        assert_eq!(context.release(), "rabbitmq");
    }

    #[test]
    fn selecting_default_clears_override() {
        let mut context = ConnectionContext::new("rabbitmq");
        context.select("reporting");
        context.select("rabbitmq");
        assert!(!context.is_overridden());
    }
}
