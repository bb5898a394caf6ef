//! Correction detection in user messages.
//!
//! The coach sometimes states a fact from the dossier that the user then
//! corrects. Three kinds of correction are detected from compiled marker
//! sets; a hit produces a response prefix, invalidates the cached dossier
//! and signals the coach to re-ground in the user's latest statement.

use regex::Regex;

/// The kind of correction detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionType {
    /// Direct denial: the stated fact is wrong.
    FactWrong,
    /// The fact was true before and no longer is.
    Outdated,
    /// The fact is partially right and needs refinement.
    Partial,
}

/// A detected correction.
#[derive(Debug, Clone)]
pub struct DetectedCorrection {
    /// The kind.
    pub correction_type: CorrectionType,
    /// Detection confidence.
    pub confidence: f64,
    /// The user's correcting message.
    pub user_correction: String,
    /// The coach claim being corrected, truncated.
    pub original_claim: Option<String>,
    /// Response prefix for the coach.
    pub suggested_response: String,
}

/// Markers of a direct correction.
const DIRECT_CORRECTION_MARKERS: &[&str] = &[
    r"нет[,.]?\s*(на самом деле|это не так)",
    r"это\s+(не\s+так|неверно|неправда|ошибка)",
    r"ты\s+(ошиб|не\s*прав|путаешь)",
    r"я\s+не\s+(говорил|имел|хотел)",
    r"ты\s+меня\s+(не\s*понял|неправильно)",
];

/// Markers of outdated information.
const OUTDATED_MARKERS: &[&str] = &[
    r"это\s+было\s+(раньше|давно|в прошлом)",
    r"(раньше|когда-то)\s+да[,.]?\s+(но\s+)?сейчас",
    r"уже\s+(не|нет)",
    r"больше\s+не",
    r"с\s+тех\s+пор\s+(изменил|поменял)",
    r"теперь\s+(по-другому|иначе)",
];

/// Markers of a partial correction.
const PARTIAL_MARKERS: &[&str] = &[
    r"не\s+совсем\s+(так|верно|правильно)?",
    r"частично\s+(да|верно)",
    r"в\s+целом\s+да[,.]?\s+но",
    r"скорее",
    r"точнее\s+будет",
];

/// Detects corrections in user messages.
pub struct CorrectionDetector {
    direct: Vec<Regex>,
    outdated: Vec<Regex>,
    partial: Vec<Regex>,
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("correction marker must compile"))
        .collect()
}

impl CorrectionDetector {
    /// Compile the marker sets.
    pub fn new() -> Self {
        Self {
            direct: compile(DIRECT_CORRECTION_MARKERS),
            outdated: compile(OUTDATED_MARKERS),
            partial: compile(PARTIAL_MARKERS),
        }
    }

    /// Check one user message, with the coach's previous message for
    /// context.
    pub fn detect(
        &self,
        user_message: &str,
        last_coach_message: Option<&str>,
    ) -> Option<DetectedCorrection> {
        let message = user_message.to_lowercase();

        let (correction_type, confidence) = if self.direct.iter().any(|p| p.is_match(&message)) {
            (CorrectionType::FactWrong, 0.9)
        } else if self.outdated.iter().any(|p| p.is_match(&message)) {
            (CorrectionType::Outdated, 0.85)
        } else if self.partial.iter().any(|p| p.is_match(&message)) {
            (CorrectionType::Partial, 0.7)
        } else {
            return None;
        };

        tracing::info!(
            correction_type = ?correction_type,
            confidence,
            "correction detected in user message"
        );

        Some(DetectedCorrection {
            correction_type,
            confidence,
            user_correction: user_message.to_string(),
            original_claim: last_coach_message.map(|m| {
                let mut end = m.len().min(200);
                while !m.is_char_boundary(end) {
                    end -= 1;
                }
                m[..end].to_string()
            }),
            suggested_response: suggested_response(correction_type).to_string(),
        })
    }
}

impl Default for CorrectionDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn suggested_response(correction_type: CorrectionType) -> &'static str {
    match correction_type {
        CorrectionType::FactWrong => "Спасибо что поправил. Расскажи, как на самом деле?",
        CorrectionType::Outdated => "Понял, ситуация изменилась. Как обстоят дела сейчас?",
        CorrectionType::Partial => "Понял, уточни пожалуйста.",
    }
}
