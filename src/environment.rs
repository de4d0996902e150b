use std::collections::HashMap;

/// Suffix of the variable SDK clients consult for a mock endpoint override.
const ENDPOINT_VAR_SUFFIX: &str = "_mock_endpoint_url";

/// A set of environment variables handed to child processes.
///
/// Uses `set` rather than `insert` so call sites read as configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment(HashMap<String, String>);

impl Environment {
    /// Creates a new empty environment variable set.
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Sets an environment variable in this set.
    ///
    /// # Examples
    /// ```
    /// use exitstack::Environment;
    ///
    /// let mut env = Environment::new();
    /// env.set("s3_mock_endpoint_url", "http://127.0.0.1:5000");
    /// assert_eq!(env.len(), 1);
    /// ```
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Extends this environment with variables from another environment.
    ///
    /// Variables in `other` overwrite variables with the same name.
    pub fn extend(&mut self, other: Environment) {
        self.0.extend(other.0);
    }

    /// Consumes this Environment and returns the underlying map.
    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl From<HashMap<String, String>> for Environment {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

/// Name of the variable holding the mock endpoint for `service`.
///
/// ```
/// assert_eq!(exitstack::endpoint_env_var("s3"), "s3_mock_endpoint_url");
/// ```
pub fn endpoint_env_var(service: &str) -> String {
    format!("{}{}", service, ENDPOINT_VAR_SUFFIX)
}

/// Endpoint an SDK client for `service` should talk to.
///
/// An explicitly configured endpoint always wins; otherwise the
/// `{service}_mock_endpoint_url` variable is consulted. `None` means the
/// client should use its regular endpoint.
pub fn resolve_endpoint_url(service: &str, explicit: Option<&str>) -> Option<String> {
    match explicit {
        Some(url) => Some(url.to_string()),
        None => std::env::var(endpoint_env_var(service))
            .ok()
            .filter(|url| !url.is_empty()),
    }
}
