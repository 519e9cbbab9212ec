//! Error plumbing shared by the arena crates.
//!
//! - [`Location`] is captured implicitly by every `snafu` error variant so a
//!   failure can be traced back to the call site that produced it.
//! - [`Report`] renders an error together with its `source()` chain.
//! - [`report`] turns an error describing a broken invariant into a panic.
//!   It is reserved for defects (double release, corrupted boundary tags)
//!   where continuing would risk handing out the same bytes twice.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::{error::Error, fmt, panic};

use snafu::GenerateImplicitData;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static panic::Location<'static>);

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors that remember where they were raised.
///
/// Implemented by the error enums of the arena crates so that [`Report`] can
/// print the origin of each link in a cause chain.
pub trait Located {
    fn location(&self) -> Option<Location>;
}

pub struct Report<'a, E> {
    error: &'a E,
}

impl<E> fmt::Debug for Report<'_, E>
where
    E: Error + Located,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<'_, E>
where
    E: Error + Located,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        if let Some(loc) = self.error.location() {
            writeln!(f, "  at {loc}")?;
        }
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {s}")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

impl<'a, E> Report<'a, E> {
    pub fn new(error: &'a E) -> Self {
        Self { error }
    }
}

/// Aborts the current operation with a rendered report of `err`.
#[track_caller]
pub fn report<E>(err: E) -> !
where
    E: Error + Located,
{
    let report = Report::new(&err);
    panic!("Critical error occurred\n\n{report}");
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::io;

    use snafu::Snafu;

    use super::*;

    #[derive(Debug, Snafu)]
    #[snafu(display("outer failure"))]
    struct OuterError {
        #[snafu(implicit)]
        location: Location,
        source: io::Error,
    }

    impl Located for OuterError {
        fn location(&self) -> Option<Location> {
            Some(self.location)
        }
    }

    fn outer() -> OuterError {
        OuterError {
            location: Location::generate(),
            source: io::Error::other("inner failure"),
        }
    }

    #[test]
    fn report_renders_cause_chain() {
        let err = outer();
        let rendered = Report::new(&err).to_string();
        assert!(rendered.starts_with("Error: outer failure\n"));
        assert!(rendered.contains("Caused by:"));
        assert!(rendered.contains("   0: inner failure"));
        assert!(rendered.contains(file!()));
    }

    #[test]
    #[should_panic(expected = "Critical error occurred")]
    fn report_panics() {
        report(outer());
    }
}
