use std::{error::Error as StdError, fmt, sync::Arc};

/// Boxed error used where listeners or collaborators return arbitrary failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A collection of independent failures reported together.
///
/// Closing many writers, many chain layers or many volumes never stops at the
/// first failure; every failure is collected here instead.
#[derive(Debug, Clone, Default)]
pub struct MultiError {
    errors: Vec<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl MultiError {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one failure.
    pub fn push<E>(&mut self, err: E)
    where
        E: Into<BoxError>,
    {
        self.errors.push(Arc::from(err.into()));
    }

    /// Add one failure with a message prefix.
    pub fn push_prefixed<E>(&mut self, prefix: impl fmt::Display, err: E)
    where
        E: fmt::Display,
    {
        self.errors
            .push(Arc::from(BoxError::from(format!("{prefix}{err}"))));
    }

    /// Merge every failure of `other` into `self`, keeping order.
    pub fn extend(&mut self, other: MultiError) {
        self.errors.extend(other.errors);
    }

    /// Number of collected failures.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True when nothing failed.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterate collected failures in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(dyn StdError + Send + Sync + 'static)> {
        self.errors.iter().map(|e| e.as_ref())
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("no error"),
            [single] => write!(f, "{single}"),
            many => {
                for (i, err) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str("\n")?;
                    }
                    write!(f, "- {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl StdError for MultiError {}

#[cfg(test)]
mod tests {
    use super::MultiError;

    #[test]
    fn single_error_is_not_listed() {
        let mut errs = MultiError::new();
        errs.push("boom");
        assert_eq!(errs.to_string(), "boom");
    }

    #[test]
    fn many_errors_are_listed_in_order() {
        let mut errs = MultiError::new();
        errs.push("error (3)");
        errs.push("error (2)");
        errs.push_prefixed("cannot close: ", "error (1)");
        assert_eq!(errs.len(), 3);
        assert_eq!(
            errs.to_string(),
            "- error (3)\n- error (2)\n- cannot close: error (1)"
        );
        assert!(errs.into_result().is_err());
        assert!(MultiError::new().into_result().is_ok());
    }
}
