//! Diagnostics emitted by phases: one line per correction, aggregated
//! into a per-phase report. Presentation (colors, progress bars) is the
//! outer tool's job; this crate only owns the *content* of each line,
//! since it is part of the testable contract (§8).

use std::fmt;
use std::time::Duration;

use crate::error::ErrorKind;

/// A single correction or would-be correction.
#[derive(Debug, Clone)]
pub struct Correction {
    pub inumber: Option<u64>,
    pub ag: Option<u32>,
    pub rule: &'static str,
    /// True when running in dry-run mode — the line is prefixed "would".
    pub dry_run: bool,
}

impl Correction {
    pub fn new(rule: &'static str, dry_run: bool) -> Self {
        Correction { inumber: None, ag: None, rule, dry_run }
    }

    pub fn inode(mut self, ino: u64) -> Self {
        self.inumber = Some(ino);
        self
    }

    pub fn ag(mut self, ag: u32) -> Self {
        self.ag = Some(ag);
        self
    }
}

impl fmt::Display for Correction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dry_run {
            write!(f, "would ")?;
        }
        write!(f, "{}", self.rule)?;
        if let Some(ag) = self.ag {
            write!(f, " ag={ag}")?;
        }
        if let Some(ino) = self.inumber {
            write!(f, " ino={ino}")?;
        }
        Ok(())
    }
}

/// Aggregate result of one phase run.
#[derive(Debug, Default, Clone)]
pub struct PhaseReport {
    pub phase_name: &'static str,
    pub corrections: Vec<Correction>,
    pub error_counts: [u64; 6],
    pub elapsed: Option<Duration>,
}

impl PhaseReport {
    pub fn new(phase_name: &'static str) -> Self {
        PhaseReport { phase_name, ..Default::default() }
    }

    pub fn record(&mut self, c: Correction) {
        self.corrections.push(c);
    }

    pub fn bump(&mut self, kind: ErrorKind) {
        self.error_counts[kind.index()] += 1;
    }

    pub fn merge(&mut self, other: PhaseReport) {
        self.corrections.extend(other.corrections);
        for i in 0..6 {
            self.error_counts[i] += other.error_counts[i];
        }
    }

    pub fn total_errors(&self) -> u64 {
        self.error_counts.iter().sum()
    }

    /// R1/R2: a clean run produced no mutating corrections (the
    /// needsrepair bit toggle is tracked separately by the orchestrator).
    pub fn is_clean(&self) -> bool {
        self.corrections.is_empty() && self.total_errors() == 0
    }
}
