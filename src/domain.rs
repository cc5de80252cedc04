use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SraError;

static ACCESSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(SRR|ERR|DRR)[0-9]+$").expect("valid accession regex")
});

static SPEED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)([0-9]+(?:\.[0-9]+)?)\s*([kmg]?)(b?)$").expect("valid speed regex")
});

/// Run accession served by the public SRA bucket (SRR, ERR or DRR).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Accession(String);

impl Accession {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn archive_file_name(&self) -> String {
        format!("{}.sra", self.0)
    }
}

impl fmt::Display for Accession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Accession {
    type Err = SraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !ACCESSION_RE.is_match(&normalized) {
            return Err(SraError::InvalidAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Closed interval of 1-based spot indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpotRange {
    pub start: u64,
    pub end: u64,
}

impl SpotRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for SpotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Local,
    Clustered,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Local => write!(f, "local"),
            ExecutionMode::Clustered => write!(f, "clustered"),
        }
    }
}

/// Which dump artifacts are wanted: gzip-compressed or plain, FASTA or FASTQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFilter {
    pub compressed: bool,
    pub fasta_only: bool,
}

impl OutputFilter {
    pub fn accepts(&self, file_name: &str) -> bool {
        let (stem, gzipped) = match file_name.strip_suffix(".gz") {
            Some(stem) => (stem, true),
            None => (file_name, false),
        };
        if gzipped != self.compressed {
            return false;
        }
        if self.fasta_only {
            stem.ends_with(".fasta")
        } else {
            stem.ends_with(".fastq")
        }
    }
}

impl Default for OutputFilter {
    fn default() -> Self {
        Self {
            compressed: true,
            fasta_only: false,
        }
    }
}

/// Download rate limit in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxSpeed(u64);

impl MaxSpeed {
    pub fn bytes_per_sec(&self) -> u64 {
        self.0
    }
}

impl FromStr for MaxSpeed {
    type Err = SraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || SraError::InvalidArgument(format!("invalid max speed: {value}"));
        let caps = SPEED_RE.captures(value.trim()).ok_or_else(invalid)?;
        let number: f64 = caps[1].parse().map_err(|_| invalid())?;
        let unit: u64 = match caps[2].to_ascii_lowercase().as_str() {
            "" => 1,
            "k" => 1 << 10,
            "m" => 1 << 20,
            "g" => 1 << 30,
            _ => return Err(invalid()),
        };
        let bytes = (number * unit as f64) as u64;
        if bytes == 0 {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_accession_normalizes_case() {
        let id: Accession = "srr014966".parse().unwrap();
        assert_eq!(id.as_str(), "SRR014966");
        assert_eq!(id.archive_file_name(), "SRR014966.sra");
    }

    #[test]
    fn parse_accession_rejects_other_prefixes() {
        for value in ["GSE102902", "SRX000001", "SRR", "SRRabc", ""] {
            let err = value.parse::<Accession>().unwrap_err();
            assert_matches!(err, SraError::InvalidAccession(_));
        }
    }

    #[test]
    fn filter_compressed_fastq() {
        let filter = OutputFilter::default();
        assert!(filter.accepts("SRR1_1.fastq.gz"));
        assert!(!filter.accepts("SRR1_1.fastq"));
        assert!(!filter.accepts("SRR1_1.fasta.gz"));
    }

    #[test]
    fn filter_plain_fasta() {
        let filter = OutputFilter {
            compressed: false,
            fasta_only: true,
        };
        assert!(filter.accepts("SRR1.fasta"));
        assert!(!filter.accepts("SRR1.fasta.gz"));
        assert!(!filter.accepts("SRR1.fastq"));
    }

    #[test]
    fn parse_max_speed_units() {
        assert_eq!("512".parse::<MaxSpeed>().unwrap().bytes_per_sec(), 512);
        assert_eq!("10k".parse::<MaxSpeed>().unwrap().bytes_per_sec(), 10 * 1024);
        assert_eq!("2Mb".parse::<MaxSpeed>().unwrap().bytes_per_sec(), 2 << 20);
        assert_eq!("1.5K".parse::<MaxSpeed>().unwrap().bytes_per_sec(), 1536);
        assert_matches!("fast".parse::<MaxSpeed>(), Err(SraError::InvalidArgument(_)));
        assert_matches!("0M".parse::<MaxSpeed>(), Err(SraError::InvalidArgument(_)));
    }
}
