//! Divergence detection and report formatting.

use std::collections::BTreeMap;
use std::fmt;

/// All client outputs for one iteration whose bytes did not agree.
///
/// No winner is picked: every output is reported and the operator (or a
/// later triage pass) decides who is wrong. Divergent error strings are
/// reported the same way; two clients failing differently is a finding
/// too.
#[derive(Debug, Clone)]
pub struct DivergenceReport {
    /// Seed of the iteration, sufficient to regenerate the input.
    pub seed: u64,
    /// Output bytes per client name.
    pub outputs: BTreeMap<String, Vec<u8>>,
}

/// Compare outputs by exact byte equality; a report is produced as soon
/// as any two disagree.
pub fn find_divergence(
    seed: u64,
    outputs: &BTreeMap<String, Vec<u8>>,
) -> Option<DivergenceReport> {
    let mut values = outputs.values();
    let first = values.next()?;
    if values.all(|output| output == first) {
        return None;
    }
    Some(DivergenceReport {
        seed,
        outputs: outputs.clone(),
    })
}

impl fmt::Display for DivergenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "outputs diverge at seed {}:", self.seed)?;
        for (name, output) in &self.outputs {
            writeln!(f, "  {}: {}", name, hex::encode(output))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(entries: &[(&str, &[u8])]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
            .collect()
    }

    #[test]
    fn test_agreement_yields_no_report() {
        let results = outputs(&[("geth", b"abc"), ("reth", b"abc"), ("nimbus", b"abc")]);
        assert!(find_divergence(0, &results).is_none());
    }

    #[test]
    fn test_single_client_never_diverges() {
        let results = outputs(&[("geth", b"abc")]);
        assert!(find_divergence(3, &results).is_none());
    }

    #[test]
    fn test_no_clients_no_report() {
        assert!(find_divergence(1, &BTreeMap::new()).is_none());
    }

    #[test]
    fn test_divergence_reports_every_client() {
        // Two agree, one is off by a single bit: all three entries are
        // listed, including the agreeing majority.
        let results = outputs(&[("geth", b"abc"), ("nimbus", b"abd"), ("reth", b"abc")]);
        let report = find_divergence(7, &results).unwrap();
        assert_eq!(report.seed, 7);
        assert_eq!(report.outputs.len(), 3);
        assert_eq!(report.outputs["nimbus"], b"abd");
    }

    #[test]
    fn test_empty_versus_nonempty_diverges() {
        let results = outputs(&[("geth", b""), ("reth", b"x")]);
        assert!(find_divergence(0, &results).is_some());
    }

    #[test]
    fn test_display_hex_encodes_outputs() {
        let results = outputs(&[("geth", &[0xDE, 0xAD]), ("reth", &[0xBE, 0xEF])]);
        let report = find_divergence(42, &results).unwrap();
        let text = report.to_string();
        assert!(text.contains("seed 42"));
        assert!(text.contains("geth: dead"));
        assert!(text.contains("reth: beef"));
    }
}
