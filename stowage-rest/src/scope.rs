//! Path scoping for the single-user deployment.

use stowage::{
    errors::Error,
    path::{FilePath, UserScope},
};

/// Joins request paths onto one configured root. [`FilePath`] already
/// rejects traversal segments, so the join cannot escape.
#[derive(Debug, Clone)]
pub struct SingleUser {
    id: String,
    root: String,
}

impl SingleUser {
    /// A scope for `id`, rooted at `root` inside the driver's
    /// namespace. An empty root maps paths through unchanged.
    #[must_use]
    pub fn new(id: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }
}

impl UserScope for SingleUser {
    fn user_id(&self) -> &str {
        &self.id
    }

    fn scoped(&self, path: &FilePath) -> Result<String, Error> {
        let root = self.root.trim_matches('/');

        if root.is_empty() {
            Ok(path.as_str().to_owned())
        } else {
            Ok(format!("{root}/{path}"))
        }
    }
}
