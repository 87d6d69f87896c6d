//! Verification report.
//!
//! Counts the fused operators present in an optimized graph and compares
//! them with what a fully optimized encoder of the same depth contains:
//! one EmbedLayerNormalization, one Attention and one Gelu per layer, and two
//! normalizations (LayerNormalization or SkipLayerNormalization) per layer.
//! The comparison is advisory; a partially optimized model is still valid.

use std::fmt;

use serde::Serialize;

use crate::fusion::FusionFailure;
use crate::graph::Graph;

/// Fused-operator kinds tallied by the report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ReportKind {
    EmbedLayerNormalization,
    Attention,
    Gelu,
    LayerNormalization,
    SkipLayerNormalization,
    /// LayerNormalization and SkipLayerNormalization checked together
    Normalizations,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportKind::EmbedLayerNormalization => "EmbedLayerNormalization",
            ReportKind::Attention => "Attention",
            ReportKind::Gelu => "Gelu",
            ReportKind::LayerNormalization => "LayerNormalization",
            ReportKind::SkipLayerNormalization => "SkipLayerNormalization",
            ReportKind::Normalizations => "LayerNormalization+SkipLayerNormalization",
        };
        f.write_str(name)
    }
}

/// Number of fused operators present, by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FusionCounts {
    pub embed_layer_norm: usize,
    pub attention: usize,
    /// Gelu and FastGelu together
    pub gelu: usize,
    pub layer_norm: usize,
    pub skip_layer_norm: usize,
}

impl FusionCounts {
    pub fn from_graph(graph: &Graph) -> Self {
        Self {
            embed_layer_norm: graph.count_op("EmbedLayerNormalization"),
            attention: graph.count_op("Attention"),
            gelu: graph.count_op("Gelu") + graph.count_op("FastGelu"),
            layer_norm: graph.count_op("LayerNormalization"),
            skip_layer_norm: graph.count_op("SkipLayerNormalization"),
        }
    }

    pub fn get(&self, kind: ReportKind) -> usize {
        match kind {
            ReportKind::EmbedLayerNormalization => self.embed_layer_norm,
            ReportKind::Attention => self.attention,
            ReportKind::Gelu => self.gelu,
            ReportKind::LayerNormalization => self.layer_norm,
            ReportKind::SkipLayerNormalization => self.skip_layer_norm,
            ReportKind::Normalizations => self.layer_norm + self.skip_layer_norm,
        }
    }
}

/// Expected counts for a fully optimized encoder with `layers` layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpectedCounts {
    pub layers: usize,
    pub embed_layer_norm: usize,
    pub attention: usize,
    pub gelu: usize,
    /// LayerNormalization + SkipLayerNormalization
    pub normalizations: usize,
}

impl ExpectedCounts {
    pub fn for_layers(layers: usize) -> Self {
        Self {
            layers,
            embed_layer_norm: 1,
            attention: layers,
            gelu: layers,
            normalizations: 2 * layers,
        }
    }
}

/// One kind whose count differs from the expectation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deficit {
    pub kind: ReportKind,
    pub expected: usize,
    pub actual: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub counts: FusionCounts,
    pub expected: Option<ExpectedCounts>,
    pub fully_optimized: bool,
    pub deficits: Vec<Deficit>,
    pub failures: Vec<FusionFailure>,
}

impl Report {
    /// Compare `counts` with `expected`. Without an expectation model the
    /// report is never fully optimized and lists no deficits.
    ///
    /// Layer and skip normalizations are checked as a pair against the 2L
    /// total, since which one a normalization becomes depends on the
    /// residual structure.
    pub fn summarize(counts: FusionCounts, expected: Option<ExpectedCounts>, failures: Vec<FusionFailure>) -> Self {
        let mut deficits = Vec::new();
        if let Some(expected) = expected {
            let checks = [
                (ReportKind::EmbedLayerNormalization, expected.embed_layer_norm),
                (ReportKind::Attention, expected.attention),
                (ReportKind::Gelu, expected.gelu),
                (ReportKind::Normalizations, expected.normalizations),
            ];
            for (kind, want) in checks {
                if counts.get(kind) != want {
                    deficits.push(Deficit {
                        kind,
                        expected: want,
                        actual: counts.get(kind),
                    });
                }
            }
        }

        Self {
            counts,
            fully_optimized: expected.is_some() && deficits.is_empty(),
            expected,
            deficits,
            failures,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fusion report:")?;
        let rows = [
            ("EmbedLayerNormalization", self.counts.embed_layer_norm),
            ("Attention", self.counts.attention),
            ("Gelu", self.counts.gelu),
            ("LayerNormalization", self.counts.layer_norm),
            ("SkipLayerNormalization", self.counts.skip_layer_norm),
        ];
        for (name, count) in rows {
            writeln!(f, "  {name:<24} {count}")?;
        }

        match &self.expected {
            None => writeln!(f, "  no expectation for this model type")?,
            Some(expected) if self.fully_optimized => {
                writeln!(f, "  fully optimized ({} layers)", expected.layers)?
            }
            Some(expected) => {
                writeln!(f, "  partially optimized ({} layers):", expected.layers)?;
                for deficit in &self.deficits {
                    writeln!(
                        f,
                        "    {}: expected {}, found {}",
                        deficit.kind, deficit.expected, deficit.actual
                    )?;
                }
            }
        }

        if !self.failures.is_empty() {
            writeln!(f, "  fusion failures:")?;
            for failure in &self.failures {
                writeln!(f, "    {failure}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(attention: usize, layer_norm: usize, skip: usize) -> FusionCounts {
        FusionCounts {
            embed_layer_norm: 1,
            attention,
            gelu: 4,
            layer_norm,
            skip_layer_norm: skip,
        }
    }

    #[test]
    fn test_fully_optimized() {
        let report = Report::summarize(counts(4, 0, 8), Some(ExpectedCounts::for_layers(4)), Vec::new());
        assert!(report.fully_optimized);
        assert!(report.deficits.is_empty());
    }

    #[test]
    fn test_normalization_pair_is_interchangeable() {
        let report = Report::summarize(counts(4, 1, 7), Some(ExpectedCounts::for_layers(4)), Vec::new());
        assert!(report.fully_optimized);
    }

    #[test]
    fn test_single_attention_deficit() {
        let report = Report::summarize(counts(3, 0, 8), Some(ExpectedCounts::for_layers(4)), Vec::new());
        assert!(!report.fully_optimized);
        assert_eq!(
            report.deficits,
            vec![Deficit {
                kind: ReportKind::Attention,
                expected: 4,
                actual: 3,
            }]
        );
    }

    #[test]
    fn test_normalization_overshoot_reported_as_pair() {
        // unfused embedding: its LayerNormalization survives next to 2L others
        let mut c = counts(4, 1, 8);
        c.embed_layer_norm = 0;
        let report = Report::summarize(c, Some(ExpectedCounts::for_layers(4)), Vec::new());
        assert!(report.deficits.contains(&Deficit {
            kind: ReportKind::Normalizations,
            expected: 8,
            actual: 9,
        }));
        assert!(report
            .to_string()
            .contains("LayerNormalization+SkipLayerNormalization: expected 8, found 9"));
    }

    #[test]
    fn test_no_expectation() {
        let report = Report::summarize(counts(4, 0, 8), None, Vec::new());
        assert!(!report.fully_optimized);
        assert!(report.deficits.is_empty());
        assert!(report.to_string().contains("no expectation"));
    }

    #[test]
    fn test_serializes_to_json() {
        let report = Report::summarize(counts(3, 0, 8), Some(ExpectedCounts::for_layers(4)), Vec::new());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["fully_optimized"], false);
        assert_eq!(json["deficits"][0]["kind"], "Attention");
        assert_eq!(json["counts"]["skip_layer_norm"], 8);
    }
}
