use std::{error::Error, fmt};

use arena_alloc::error::Location;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub struct GenericError {
    message: String,
    #[snafu(implicit)]
    location: Location,
    #[snafu(source(from(Box<dyn Error>, Some)))]
    source: Option<Box<dyn Error>>,
}

/// Renders an error with its capture location and cause chain.
pub struct Report {
    error: GenericError,
}

impl Report {
    pub fn new(error: GenericError) -> Self {
        Self { error }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: \x1B[31m{}\x1B[0m", self.error)?;
        writeln!(f, "  at \x1B[90m{}\x1B[0m", self.error.location)?;
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: \x1B[31m{s}\x1B[0m")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}
