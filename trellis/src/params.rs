/**
The path parameters bound by the route matcher for one request.

Keys are unique per request and ordered by binding order. The backing
vec is truncated in place between requests.
*/
#[derive(Debug, Default)]
pub struct RequestParams {
    entries: Vec<(String, String)>,
}

impl RequestParams {
    /// Construct an empty parameter store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `value`. An existing binding with the same key is
    /// overwritten.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// The value bound to `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The value bound to `key`, or `def` when absent.
    pub fn get_default<'a>(&'a self, key: &str, def: &'a str) -> &'a str {
        self.get(key).unwrap_or(def)
    }

    /// The value bound to `key` parsed as an integer.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// The number of bound parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no parameters are bound.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all bindings, retaining the allocation for reuse.
    pub fn reset(&mut self) {
        self.entries.truncate(0);
    }

    /// Iterate the bindings in binding order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Visit every binding in binding order.
    pub fn visit(&self, mut visitor: impl FnMut(&str, &str)) {
        for (key, value) in &self.entries {
            visitor(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_lookup() {
        let mut params = RequestParams::new();
        params.set("id", "42");
        params.set("name", "ada");
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get_i64("id"), Some(42));
        assert_eq!(params.get_default("missing", "x"), "x");
        assert_eq!(
            params.iter().collect::<Vec<_>>(),
            vec![("id", "42"), ("name", "ada")]
        );

        params.set("id", "7");
        assert_eq!(params.get("id"), Some("7"));
        assert_eq!(params.len(), 2);

        params.reset();
        assert!(params.is_empty());
    }
}
