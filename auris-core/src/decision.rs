//! Verdict derivation from a classifier score vector.
//!
//! ## Algorithm (per inference cycle)
//!
//! 1. Peak-normalize the window (divisor floored at 0.001, output clamped
//!    to [-1, 1]); keep the raw peak.
//! 2. Find the top class and its score (first occurrence wins ties).
//! 3. `silence` when the top score is under 0.08 or the raw peak under 0.01.
//! 4. `safe` when not silent and either the top class is in the safe set,
//!    or the speech score exceeds 0.05 while no single class dominates
//!    (top score under 0.85).

use serde::{Deserialize, Serialize};

/// Score-vector index of the AudioSet "Speech" class.
pub const SPEECH_CLASS: usize = 0;

/// Divisor floor for peak normalization. Keeps near-silent windows from
/// blowing up to full scale.
pub const PEAK_NORM_FLOOR: f32 = 0.001;

/// Classifier output indices treated as benign ambient sound.
///
/// Index numbering follows the 521-class AudioSet ordering used by the
/// YAMNet export (`yamnet_class_map.csv`): the speech/conversation family,
/// whispering, the laughter family, and running water. Breathing and its
/// neighbours are deliberately absent.
pub const SAFE_CLASSES: &[usize] = &[
    0,   // Speech
    1,   // Child speech, kid speaking
    2,   // Conversation
    3,   // Narration, monologue
    4,   // Babbling
    12,  // Whispering
    13,  // Laughter
    14,  // Baby laughter
    15,  // Giggle
    16,  // Snicker
    17,  // Belly laugh
    18,  // Chuckle, chortle
    282, // Water
    283, // Rain
];

/// Threshold tunables for verdict derivation.
///
/// Defaults carry the calibrated production values; they are exposed as
/// config so a sink can trade sensitivity for false-positive rate.
#[derive(Debug, Clone, Copy)]
pub struct DecisionConfig {
    /// Top score below this reads as silence/no-signal. Default: 0.08.
    pub silence_score_floor: f32,
    /// Raw window peak below this reads as silence. Default: 0.01.
    pub silence_peak_floor: f32,
    /// Speech score above this admits the permissive speech band. Default: 0.05.
    pub speech_score_floor: f32,
    /// Top score at or above this closes the permissive band — one non-safe
    /// class dominates. Default: 0.85.
    pub dominant_score_ceiling: f32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            silence_score_floor: 0.08,
            silence_peak_floor: 0.01,
            speech_score_floor: 0.05,
            dominant_score_ceiling: 0.85,
        }
    }
}

/// Normalize a window in place by its peak absolute amplitude.
///
/// The divisor is floored at [`PEAK_NORM_FLOOR`] so an all-zero window maps
/// to all zeros rather than dividing by zero. Output is clamped to [-1, 1].
/// Returns the raw pre-normalization peak, which feeds the silence check.
pub fn normalize_peak(samples: &mut [f32]) -> f32 {
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    let divisor = peak.max(PEAK_NORM_FLOOR);
    for s in samples.iter_mut() {
        *s = (*s / divisor).clamp(-1.0, 1.0);
    }
    peak
}

/// Derived state for one inference cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    /// Index of the highest-scoring class.
    pub top_index: usize,
    /// Score of the highest-scoring class.
    pub top_score: f32,
    /// Score of the speech class (index 0).
    pub speech_score: f32,
    /// Raw peak amplitude of the window before normalization.
    pub peak: f32,
    /// Whether the cycle reads as silence/no-signal.
    pub is_silence: bool,
    /// The safety verdict for this cycle.
    pub is_safe: bool,
}

impl Verdict {
    /// Derive a verdict from a score vector and the window's raw peak.
    pub fn derive(scores: &[f32], peak: f32, cfg: &DecisionConfig) -> Self {
        let (top_index, top_score) = scores
            .iter()
            .enumerate()
            .fold((0usize, f32::MIN), |acc, (i, &s)| {
                if s > acc.1 {
                    (i, s)
                } else {
                    acc
                }
            });
        let speech_score = scores.get(SPEECH_CLASS).copied().unwrap_or(0.0);

        let is_silence = top_score < cfg.silence_score_floor || peak < cfg.silence_peak_floor;
        let is_safe = !is_silence
            && (SAFE_CLASSES.contains(&top_index)
                || (speech_score > cfg.speech_score_floor
                    && top_score < cfg.dominant_score_ceiling));

        Self {
            top_index,
            top_score,
            speech_score,
            peak,
            is_silence,
            is_safe,
        }
    }

    /// Short status label for display sinks.
    pub fn label(&self) -> &'static str {
        if self.is_silence {
            "silence"
        } else if self.is_safe {
            "safe"
        } else {
            "unsafe"
        }
    }

    /// One-line debug text for display sinks and logs.
    pub fn summary(&self) -> String {
        format!(
            "{}: class {} p={:.2} speech={:.2} peak={:.3}",
            self.label(),
            self.top_index,
            self.top_score,
            self.speech_score,
            self.peak
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scores_with(entries: &[(usize, f32)]) -> Vec<f32> {
        let mut scores = vec![0.0f32; crate::classify::NUM_CLASSES];
        for &(i, s) in entries {
            scores[i] = s;
        }
        scores
    }

    #[test]
    fn zero_peak_window_normalizes_to_zeros() {
        let mut window = vec![0.0f32; 256];
        let peak = normalize_peak(&mut window);
        assert_relative_eq!(peak, 0.0);
        assert!(window.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn normalization_scales_to_unit_peak_and_clamps() {
        let mut window = vec![0.25, -0.5, 0.1];
        let peak = normalize_peak(&mut window);
        assert_relative_eq!(peak, 0.5);
        assert_relative_eq!(window[0], 0.5);
        assert_relative_eq!(window[1], -1.0);
        assert_relative_eq!(window[2], 0.2);
        assert!(window.iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }

    #[test]
    fn quiet_window_uses_divisor_floor() {
        // Peak below the floor: division uses 0.001, never the tiny peak.
        let mut window = vec![0.0005f32; 16];
        let peak = normalize_peak(&mut window);
        assert_relative_eq!(peak, 0.0005);
        assert_relative_eq!(window[0], 0.5);
    }

    #[test]
    fn low_top_score_is_silence_regardless_of_amplitude() {
        let scores = scores_with(&[(100, 0.07)]);
        let v = Verdict::derive(&scores, 0.9, &DecisionConfig::default());
        assert!(v.is_silence);
        assert!(!v.is_safe);
    }

    #[test]
    fn low_peak_is_silence_regardless_of_scores() {
        let scores = scores_with(&[(SPEECH_CLASS, 0.9)]);
        let v = Verdict::derive(&scores, 0.005, &DecisionConfig::default());
        assert!(v.is_silence);
        assert!(!v.is_safe);
    }

    #[test]
    fn safe_class_top_is_safe() {
        let scores = scores_with(&[(13, 0.5)]); // Laughter
        let v = Verdict::derive(&scores, 0.2, &DecisionConfig::default());
        assert_eq!(v.top_index, 13);
        assert!(!v.is_silence);
        assert!(v.is_safe);
    }

    #[test]
    fn speech_band_admits_non_safe_top() {
        // Non-safe top class at 0.5, speech at 0.2: permissive band applies.
        let scores = scores_with(&[(300, 0.5), (SPEECH_CLASS, 0.2)]);
        let v = Verdict::derive(&scores, 0.2, &DecisionConfig::default());
        assert!(!SAFE_CLASSES.contains(&v.top_index));
        assert!(v.is_safe);
    }

    #[test]
    fn dominant_non_safe_top_is_unsafe_despite_speech() {
        let scores = scores_with(&[(300, 0.9), (SPEECH_CLASS, 0.5)]);
        let v = Verdict::derive(&scores, 0.2, &DecisionConfig::default());
        assert!(!v.is_silence);
        assert!(!v.is_safe);
    }

    #[test]
    fn weak_speech_under_non_safe_top_is_unsafe() {
        let scores = scores_with(&[(300, 0.5), (SPEECH_CLASS, 0.04)]);
        let v = Verdict::derive(&scores, 0.2, &DecisionConfig::default());
        assert!(!v.is_safe);
    }

    #[test]
    fn tie_break_picks_first_occurrence() {
        let scores = scores_with(&[(7, 0.4), (200, 0.4)]);
        let v = Verdict::derive(&scores, 0.2, &DecisionConfig::default());
        assert_eq!(v.top_index, 7);
    }

    #[test]
    fn breathing_top_is_not_safe() {
        // Breathing (36) is outside the safe set; weak speech score keeps
        // the permissive band closed.
        let scores = scores_with(&[(36, 0.6), (SPEECH_CLASS, 0.02)]);
        let v = Verdict::derive(&scores, 0.3, &DecisionConfig::default());
        assert!(!v.is_safe);
    }

    #[test]
    fn summary_names_the_label() {
        let scores = scores_with(&[(13, 0.5)]);
        let v = Verdict::derive(&scores, 0.2, &DecisionConfig::default());
        let text = v.summary();
        assert!(text.starts_with("safe:"), "summary={text}");
        assert!(text.contains("class 13"));
    }
}
