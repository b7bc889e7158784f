//! Synthesized phoneme timing for input that arrives without it.

use super::shapes::{VisemeCategory, clean_phoneme, is_silence_label};
use super::timeline::GroupedViseme;
use crate::config::TimingConfig;

const VOWELS: [&str; 15] = [
    "AA", "AE", "AH", "AO", "AW", "AY", "EH", "ER", "EY", "IH", "IY", "OW", "OY", "UH", "UW",
];

/// Duration in seconds for a cleaned phoneme.
///
/// Explicit overrides win, then the vowel/consonant default. The result is
/// floored per category so open and rounded shapes stay visible.
pub fn phoneme_duration(phoneme: &str, timing: &TimingConfig) -> f64 {
    let base = match timing.overrides.get(phoneme) {
        Some(&secs) => secs,
        None if VOWELS.contains(&phoneme) => timing.vowel_secs,
        None => timing.consonant_secs,
    };

    let vowel_like = VisemeCategory::for_phoneme(phoneme).is_some_and(VisemeCategory::is_vowel_like);
    if vowel_like {
        base.max(timing.vowel_floor_secs)
    } else {
        base.max(timing.consonant_floor_secs)
    }
}

/// Clean raw labels (`"AA1"`, `","`) and drop the ones that end up empty.
pub fn clean_phonemes<S: AsRef<str>>(labels: &[S]) -> Vec<String> {
    labels
        .iter()
        .map(|label| clean_phoneme(label.as_ref()))
        .filter(|label| !label.is_empty())
        .collect()
}

/// Group label for a phoneme: its category name, `sil` for pauses.
fn group_label(phoneme: &str) -> &'static str {
    if is_silence_label(phoneme) {
        return "sil";
    }
    VisemeCategory::for_phoneme(phoneme).map_or("NEUTRAL", VisemeCategory::name)
}

/// Merge consecutive phonemes that share a viseme category.
///
/// Phonemes are laid out back to back from 0. Returns an empty list when
/// the two slices differ in length.
pub fn group_phonemes<S: AsRef<str>>(phonemes: &[S], durations: &[f64]) -> Vec<GroupedViseme> {
    if phonemes.len() != durations.len() {
        return Vec::new();
    }

    let mut grouped: Vec<GroupedViseme> = Vec::new();
    let mut cursor = 0.0;
    for (phoneme, &duration) in phonemes.iter().zip(durations) {
        let phoneme = phoneme.as_ref();
        let group = group_label(phoneme);
        match grouped.last_mut() {
            Some(last) if last.group == group => {
                last.phonemes.push(phoneme.to_owned());
                last.end += duration;
            }
            _ => grouped.push(GroupedViseme {
                group: group.to_owned(),
                phonemes: vec![phoneme.to_owned()],
                start: cursor,
                end: cursor + duration,
            }),
        }
        cursor += duration;
    }
    grouped
}
