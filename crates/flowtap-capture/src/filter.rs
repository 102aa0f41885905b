//! Capture filter expressions
//!
//! The expression is BPF syntax, compiled once when the source is opened.

use crate::CaptureError;
use pcap::{Activated, Capture, Linktype};

/// A BPF capture expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFilter {
    expression: String,
}

impl Default for CaptureFilter {
    fn default() -> Self {
        Self::new("tcp")
    }
}

impl CaptureFilter {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Compile against an Ethernet handle without opening a device
    pub fn validate(&self) -> Result<(), CaptureError> {
        let cap = Capture::dead(Linktype::ETHERNET).map_err(|e| self.error(e))?;
        cap.compile(&self.expression, true)
            .map(|_| ())
            .map_err(|e| self.error(e))
    }

    pub(crate) fn apply<T: Activated + ?Sized>(
        &self,
        cap: &mut Capture<T>,
    ) -> Result<(), CaptureError> {
        cap.filter(&self.expression, true).map_err(|e| self.error(e))
    }

    fn error(&self, source: pcap::Error) -> CaptureError {
        CaptureError::Filter {
            expression: self.expression.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_tcp() {
        assert_eq!(CaptureFilter::default().expression(), "tcp");
    }

    #[test]
    fn test_validate_accepts_bpf() {
        assert!(CaptureFilter::new("tcp port 80 or tcp port 8080").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_syntax() {
        let err = CaptureFilter::new("tcp port").validate().unwrap_err();
        assert!(matches!(err, CaptureError::Filter { .. }));
        assert!(err.to_string().contains("tcp port"));
    }
}
