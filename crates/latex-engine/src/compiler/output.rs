//! Output format handling (PDF, DVI)

use serde::{Deserialize, Serialize};

/// Output format for compiled documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pdf,
    Dvi,
}

impl OutputFormat {
    /// Get the MIME type for this format
    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "application/pdf",
            OutputFormat::Dvi => "application/x-dvi",
        }
    }

    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Dvi => "dvi",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pdf" => Ok(OutputFormat::Pdf),
            "dvi" => Ok(OutputFormat::Dvi),
            other => Err(format!("Unknown output format: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("PDF".parse::<OutputFormat>(), Ok(OutputFormat::Pdf));
        assert_eq!("dvi".parse::<OutputFormat>(), Ok(OutputFormat::Dvi));
        assert!("docx".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(OutputFormat::Pdf.mime_type(), "application/pdf");
        assert_eq!(OutputFormat::Dvi.mime_type(), "application/x-dvi");
        assert_eq!(OutputFormat::default(), OutputFormat::Pdf);
    }
}
