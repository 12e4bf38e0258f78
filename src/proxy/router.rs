use crate::config::RouteConfig;

/// A compiled route: inbound path prefix mapped to a backend plus an
/// optional outbound rewrite.
#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: String,
    pub backend: String,
    pub rewrite: Option<String>,
}

impl Route {
    /// Outbound path for an inbound path that matched this route.
    ///
    /// The matched prefix is replaced by `rewrite` (or stripped when
    /// `rewrite` is absent) and the remainder is appended verbatim.
    /// The result always starts with '/'.
    pub fn rewrite_path(&self, path: &str) -> String {
        let remainder = &path[self.prefix.len()..];
        let head = self.rewrite.as_deref().unwrap_or("");
        let joined = format!("{}{}", head, remainder);

        if joined.is_empty() {
            "/".to_string()
        } else if joined.starts_with('/') {
            joined
        } else {
            format!("/{}", joined)
        }
    }
}

/// Immutable snapshot of the routing rules.
///
/// Routes are sorted by descending prefix length when the table is
/// built, so the first prefix match during lookup is the longest one.
/// Lookups never mutate the table; reload builds a fresh table and
/// swaps it in behind `ArcSwap`.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn from_config(routes: &[RouteConfig]) -> Self {
        let mut routes: Vec<Route> = routes
            .iter()
            .map(|r| Route {
                prefix: r.prefix.clone(),
                backend: r.backend.clone(),
                rewrite: r.rewrite.clone(),
            })
            .collect();

        // Stable sort keeps config order between equal-length prefixes.
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    /// Longest-prefix match against the inbound path.
    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| path.starts_with(&r.prefix))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
