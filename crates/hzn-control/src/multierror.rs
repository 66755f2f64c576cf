//! Accumulates independent failures from a fan-out

use std::error::Error;
use std::fmt;

/// Zero or more errors collected while attempting every item of a batch
///
/// An empty `MultiError` means everything succeeded; see [`into_result`](Self::into_result).
#[derive(Debug)]
pub struct MultiError<E> {
    errors: Vec<E>,
}

impl<E> MultiError<E> {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, err: E) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[E] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<E> {
        self.errors
    }

    /// `Ok(())` if nothing was collected
    pub fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl<E> Default for MultiError<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> FromIterator<E> for MultiError<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

impl<E: fmt::Display> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            write!(f, "1 error occurred:")?;
        } else {
            write!(f, "{} errors occurred:", self.errors.len())?;
        }
        for err in &self.errors {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

impl<E: Error + 'static> Error for MultiError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.errors.first().map(|e| e as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_empty_is_success() {
        let errs: MultiError<io::Error> = MultiError::new();
        assert!(errs.is_empty());
        assert!(errs.into_result().is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut errs = MultiError::new();
        errs.push(io::Error::new(io::ErrorKind::Other, "first"));
        errs.push(io::Error::new(io::ErrorKind::Other, "second"));

        assert_eq!(errs.len(), 2);
        assert_eq!(
            errs.to_string(),
            "2 errors occurred:\n\t* first\n\t* second"
        );

        let err = errs.into_result().unwrap_err();
        assert_eq!(err.errors()[1].to_string(), "second");
        assert_eq!(err.source().unwrap().to_string(), "first");
    }

    #[test]
    fn test_single_error_wording() {
        let errs: MultiError<io::Error> =
            std::iter::once(io::Error::new(io::ErrorKind::Other, "only")).collect();
        assert_eq!(errs.to_string(), "1 error occurred:\n\t* only");
    }
}
