//! Expert specialization report aggregated over a forward pass

use std::fmt;

use serde::Serialize;

use crate::model::ForwardStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Specialization {
    High,
    Good,
    Insufficient,
}

impl Specialization {
    pub fn grade(target_usage: f32) -> Self {
        if target_usage > 0.8 {
            Specialization::High
        } else if target_usage > 0.5 {
            Specialization::Good
        } else {
            Specialization::Insufficient
        }
    }
}

impl fmt::Display for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Specialization::High => "highly specialized",
            Specialization::Good => "well specialized",
            Specialization::Insufficient => "insufficiently specialized",
        };
        f.write_str(s)
    }
}

/// Block statistics averaged for one modality
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModalitySummary {
    pub modality: String,
    /// MoE blocks that reported this modality
    pub blocks: usize,
    pub target_expert: usize,
    pub target_expert_usage: f32,
    pub selection_ratios: Vec<f32>,
    pub avg_expert_weights: Vec<f32>,
    pub avg_top_k_weights: Vec<f32>,
    pub most_used_expert: usize,
    pub specialization: Specialization,
}

impl ModalitySummary {
    pub fn target_is_most_used(&self) -> bool {
        self.most_used_expert == self.target_expert
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpertStatsReport {
    /// In first-seen order
    pub modalities: Vec<ModalitySummary>,
}

fn mean_columns(rows: &[&[f32]]) -> Vec<f32> {
    let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    (0..width)
        .map(|i| {
            let sum: f32 = rows.iter().map(|r| r.get(i).copied().unwrap_or(0.0)).sum();
            sum / rows.len() as f32
        })
        .collect()
}

/// First index of the maximum
fn argmax(v: &[f32]) -> usize {
    let mut best = 0;
    for (i, x) in v.iter().enumerate() {
        if *x > v[best] {
            best = i;
        }
    }
    best
}

impl ExpertStatsReport {
    pub fn from_context(stats: &ForwardStats) -> Self {
        let mut order: Vec<&str> = Vec::new();
        for b in &stats.blocks {
            if !order.contains(&b.stats.modality.as_str()) {
                order.push(&b.stats.modality);
            }
        }

        let modalities = order
            .into_iter()
            .map(|modality| {
                let group: Vec<_> = stats
                    .blocks
                    .iter()
                    .map(|b| &b.stats)
                    .filter(|s| s.modality == modality)
                    .collect();
                let ratios: Vec<&[f32]> = group.iter().map(|s| s.selection_ratios.as_slice()).collect();
                let weights: Vec<&[f32]> = group.iter().map(|s| s.avg_expert_weights.as_slice()).collect();
                let slots: Vec<&[f32]> = group.iter().map(|s| s.avg_top_k_weights.as_slice()).collect();
                let usage = group.iter().map(|s| s.target_expert_usage).sum::<f32>() / group.len() as f32;
                let selection_ratios = mean_columns(&ratios);
                ModalitySummary {
                    modality: modality.to_string(),
                    blocks: group.len(),
                    target_expert: group[0].target_expert,
                    target_expert_usage: usage,
                    most_used_expert: argmax(&selection_ratios),
                    selection_ratios,
                    avg_expert_weights: mean_columns(&weights),
                    avg_top_k_weights: mean_columns(&slots),
                    specialization: Specialization::grade(usage),
                }
            })
            .collect();
        Self { modalities }
    }

    pub fn is_empty(&self) -> bool {
        self.modalities.is_empty()
    }

    /// Emit one `info!` line per modality
    pub fn log(&self) {
        for m in &self.modalities {
            tracing::info!(
                modality = %m.modality,
                blocks = m.blocks,
                target_expert = m.target_expert,
                target_usage = m.target_expert_usage,
                most_used = m.most_used_expert,
                specialization = %m.specialization,
                "expert statistics"
            );
        }
    }
}

impl fmt::Display for ExpertStatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "Expert specialization")?;
        writeln!(f, "{}", "=".repeat(60))?;
        for m in &self.modalities {
            writeln!(f)?;
            writeln!(f, "{} modality ({} MoE blocks)", m.modality.to_uppercase(), m.blocks)?;
            writeln!(f, "  expected expert: Expert-{}", m.target_expert)?;
            writeln!(
                f,
                "  expected expert usage: {:.3} ({:.1}%)",
                m.target_expert_usage,
                m.target_expert_usage * 100.0
            )?;
            writeln!(f, "  selection ratio:")?;
            for (i, r) in m.selection_ratios.iter().enumerate() {
                let mark = if i == m.target_expert { '*' } else { ' ' };
                writeln!(f, "   {mark} Expert-{i}: {r:.3} ({:.1}%)", r * 100.0)?;
            }
            writeln!(f, "  average weight:")?;
            for (i, w) in m.avg_expert_weights.iter().enumerate() {
                let mark = if i == m.target_expert { '*' } else { ' ' };
                writeln!(f, "   {mark} Expert-{i}: {w:.3}")?;
            }
            writeln!(f, "  specialization: {}", m.specialization)?;
            let verdict = if m.target_is_most_used() { "OK" } else { "No" };
            let most = m.selection_ratios.get(m.most_used_expert).copied().unwrap_or(0.0);
            writeln!(
                f,
                "  most used: Expert-{} ({most:.3}) - {verdict}",
                m.most_used_expert
            )?;
        }
        write!(f, "{}", "=".repeat(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockStats;
    use crate::moe::ExpertStatistics;

    fn block(block: usize, modality: &str, target: usize, ratios: Vec<f32>) -> BlockStats {
        let usage = ratios[target];
        BlockStats {
            block,
            stats: ExpertStatistics {
                modality: modality.to_string(),
                num_experts: ratios.len(),
                top_k: 1,
                selection_counts: vec![0; ratios.len()],
                avg_expert_weights: ratios.clone(),
                avg_top_k_weights: vec![1.0],
                selection_ratios: ratios,
                target_expert: target,
                target_expert_usage: usage,
            },
        }
    }

    #[test]
    fn test_groups_by_modality() {
        let stats = ForwardStats {
            blocks: vec![
                block(0, "nuscenes", 1, vec![0.0, 1.0, 0.0, 0.0]),
                block(1, "nuscenes", 1, vec![0.0, 0.6, 0.4, 0.0]),
                block(0, "sekai", 0, vec![0.4, 0.6, 0.0, 0.0]),
            ],
        };
        let report = ExpertStatsReport::from_context(&stats);
        assert_eq!(report.modalities.len(), 2);

        let nu = &report.modalities[0];
        assert_eq!(nu.modality, "nuscenes");
        assert_eq!(nu.blocks, 2);
        assert!((nu.target_expert_usage - 0.8).abs() < 1e-6);
        assert_eq!(nu.specialization, Specialization::Good);
        assert!(nu.target_is_most_used());

        let sekai = &report.modalities[1];
        assert_eq!(sekai.specialization, Specialization::Insufficient);
        assert_eq!(sekai.most_used_expert, 1);
        assert!(!sekai.target_is_most_used());

        let text = report.to_string();
        assert!(text.contains("NUSCENES modality (2 MoE blocks)"));
        assert!(text.contains("most used: Expert-1 (0.600) - No"));
    }

    #[test]
    fn test_grades() {
        assert_eq!(Specialization::grade(1.0), Specialization::High);
        assert_eq!(Specialization::grade(0.8), Specialization::Good);
        assert_eq!(Specialization::grade(0.5), Specialization::Insufficient);
    }
}
