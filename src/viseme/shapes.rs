//! Phoneme and viseme-group shape tables.
//!
//! Every lookup produces a [`ShapeWeights`] value over the fixed
//! [`ShapeKey`] vocabulary. Lookups never fail: labels that no table
//! recognises resolve to the all-zero silence set and are logged.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Named facial controls driven by lip-sync.
///
/// Serialized names match the morph targets exposed by the avatar meshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShapeKey {
    /// Vertical mouth opening.
    LipsOpenWide,
    /// Horizontal lip stretch.
    LipsWide,
    /// Rounded lips ("oo").
    LipsRound,
    /// Lips pushed forward.
    LipsProtrude,
    /// Narrow pursed lips.
    LipsPurseNarrow,
    /// Lower lip against upper teeth.
    LipsFv,
    /// Mouth corners raised.
    LipsCornerUp,
    /// Teeth apart / jaw open.
    TeethTongueOpen,
    /// Tongue tip raised to the alveolar ridge.
    TeethTongueTipUp,
    /// Tongue between the teeth.
    TeethTongueBite,
}

impl ShapeKey {
    /// Number of controls in the vocabulary.
    pub const COUNT: usize = 10;

    /// Every control, in index order.
    pub const ALL: [ShapeKey; Self::COUNT] = [
        ShapeKey::LipsOpenWide,
        ShapeKey::LipsWide,
        ShapeKey::LipsRound,
        ShapeKey::LipsProtrude,
        ShapeKey::LipsPurseNarrow,
        ShapeKey::LipsFv,
        ShapeKey::LipsCornerUp,
        ShapeKey::TeethTongueOpen,
        ShapeKey::TeethTongueTipUp,
        ShapeKey::TeethTongueBite,
    ];

    /// Morph target name for this control.
    pub fn name(self) -> &'static str {
        match self {
            ShapeKey::LipsOpenWide => "Lips_Open_Wide",
            ShapeKey::LipsWide => "Lips_Wide",
            ShapeKey::LipsRound => "Lips_Round",
            ShapeKey::LipsProtrude => "Lips_Protude",
            ShapeKey::LipsPurseNarrow => "Lips_Purse_Narrow",
            ShapeKey::LipsFv => "Lips_FV",
            ShapeKey::LipsCornerUp => "Lips_Corner_Up",
            ShapeKey::TeethTongueOpen => "TeethTongue_Open",
            ShapeKey::TeethTongueTipUp => "TeethTongue_TipUp",
            ShapeKey::TeethTongueBite => "TeethTongue_Bite",
        }
    }

    /// Parse a morph target name. Accepts the `Lips_Protrude` spelling too.
    pub fn from_name(name: &str) -> Option<Self> {
        if name == "Lips_Protrude" {
            return Some(ShapeKey::LipsProtrude);
        }
        Self::ALL.into_iter().find(|key| key.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Weights for every [`ShapeKey`], each in `[0, 1]`.
///
/// Controls that were never set are 0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f32>", into = "BTreeMap<String, f32>")]
pub struct ShapeWeights([f32; ShapeKey::COUNT]);

impl ShapeWeights {
    /// The resting (silence) pose.
    pub const fn zero() -> Self {
        Self([0.0; ShapeKey::COUNT])
    }

    /// Build from `(key, weight)` pairs. Weights are clamped into `[0, 1]`.
    pub fn from_pairs(pairs: &[(ShapeKey, f32)]) -> Self {
        let mut weights = Self::zero();
        for &(key, value) in pairs {
            weights.set(key, value);
        }
        weights
    }

    /// Weight of a single control.
    pub fn get(&self, key: ShapeKey) -> f32 {
        self.0[key.index()]
    }

    /// Set a control, clamping into `[0, 1]`. NaN becomes 0.
    pub fn set(&mut self, key: ShapeKey, value: f32) {
        self.0[key.index()] = if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, 1.0)
        };
    }

    /// Iterate over all controls in index order.
    pub fn iter(&self) -> impl Iterator<Item = (ShapeKey, f32)> + '_ {
        ShapeKey::ALL.iter().map(|&key| (key, self.get(key)))
    }

    /// `true` when every control is exactly 0.
    pub fn is_silent(&self) -> bool {
        self.0.iter().all(|&v| v == 0.0)
    }

    /// Linear blend toward `other` by `t` (0 = self, 1 = other).
    pub fn lerp(&self, other: &ShapeWeights, t: f32) -> ShapeWeights {
        let mut out = Self::zero();
        for key in ShapeKey::ALL {
            let a = self.get(key);
            out.set(key, a + (other.get(key) - a) * t);
        }
        out
    }
}

impl TryFrom<BTreeMap<String, f32>> for ShapeWeights {
    type Error = String;

    fn try_from(map: BTreeMap<String, f32>) -> Result<Self, Self::Error> {
        let mut weights = Self::zero();
        for (name, value) in map {
            let key = ShapeKey::from_name(&name)
                .ok_or_else(|| format!("unknown shape key `{name}`"))?;
            weights.set(key, value);
        }
        Ok(weights)
    }
}

impl From<ShapeWeights> for BTreeMap<String, f32> {
    fn from(weights: ShapeWeights) -> Self {
        weights
            .iter()
            .filter(|(_, v)| *v != 0.0)
            .map(|(k, v)| (k.name().to_owned(), v))
            .collect()
    }
}

/// Coarse mouth-shape category a phoneme falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisemeCategory {
    /// Open jaw vowels (AA, AH, AO) and breathy consonants.
    Open,
    /// Open with wide lips (AE, EH, IH).
    OpenWide,
    /// Bilabial closure (B, P, M).
    Close,
    /// Sibilants and affricates.
    TeethShow,
    /// Rounded vowels.
    Round,
    /// Alveolar consonants.
    TongueUp,
    /// Dental fricatives.
    Bite,
    /// Labiodentals.
    TeethOnLips,
    /// Rest pose.
    Neutral,
}

impl VisemeCategory {
    /// Category for a cleaned ARPABET phoneme, if it has one.
    pub fn for_phoneme(phoneme: &str) -> Option<Self> {
        use VisemeCategory::*;
        let category = match phoneme {
            "AH" | "AA" | "AO" | "HH" | "NG" | "OY" => Open,
            "AE" | "AY" | "EH" | "EY" | "IH" | "G" | "Y" | "K" => OpenWide,
            "B" | "P" | "M" => Close,
            "CH" | "JH" | "S" | "SH" | "Z" | "ZH" => TeethShow,
            "AW" | "OW" | "UH" | "UW" => Round,
            "D" | "T" | "L" | "N" | "R" | "ER" => TongueUp,
            "DH" | "TH" => Bite,
            "F" | "V" | "W" => TeethOnLips,
            "SIL" | "SP" | "NEUTRAL" => Neutral,
            _ => return None,
        };
        Some(category)
    }

    /// Parse a category name as emitted by the phonemize service (`"Open_wide"`).
    pub fn from_name(name: &str) -> Option<Self> {
        use VisemeCategory::*;
        let category = match name.to_ascii_uppercase().as_str() {
            "OPEN" => Open,
            "OPEN_WIDE" => OpenWide,
            "CLOSE" => Close,
            "TEETHSHOW" => TeethShow,
            "ROUND" => Round,
            "TONGUEUP" => TongueUp,
            "BITE" => Bite,
            "TEETHONLIPS" => TeethOnLips,
            "NEUTRAL" => Neutral,
            _ => return None,
        };
        Some(category)
    }

    /// Name as emitted by the phonemize service; round-trips through [`Self::from_name`].
    pub fn name(self) -> &'static str {
        match self {
            VisemeCategory::Open => "Open",
            VisemeCategory::OpenWide => "Open_wide",
            VisemeCategory::Close => "Close",
            VisemeCategory::TeethShow => "TeethShow",
            VisemeCategory::Round => "Round",
            VisemeCategory::TongueUp => "TongueUP",
            VisemeCategory::Bite => "Bite",
            VisemeCategory::TeethOnLips => "TeethOnLips",
            VisemeCategory::Neutral => "NEUTRAL",
        }
    }

    /// Vowel-like categories hold the mouth open longer.
    pub fn is_vowel_like(self) -> bool {
        matches!(
            self,
            VisemeCategory::Open | VisemeCategory::OpenWide | VisemeCategory::Round
        )
    }

    fn weights(self) -> ShapeWeights {
        use ShapeKey::*;
        match self {
            VisemeCategory::Open => ShapeWeights::from_pairs(&[
                (LipsOpenWide, 0.85),
                (LipsWide, 0.45),
                (TeethTongueOpen, 1.0),
            ]),
            VisemeCategory::OpenWide => ShapeWeights::from_pairs(&[
                (LipsOpenWide, 0.75),
                (LipsWide, 0.8),
                (LipsCornerUp, 0.3),
                (TeethTongueOpen, 0.8),
            ]),
            VisemeCategory::Close => ShapeWeights::from_pairs(&[
                (LipsPurseNarrow, 0.95),
                (LipsProtrude, 0.25),
            ]),
            VisemeCategory::TeethShow => ShapeWeights::from_pairs(&[
                (LipsWide, 0.9),
                (LipsOpenWide, 0.32),
                (LipsPurseNarrow, 0.2),
                (TeethTongueTipUp, 0.7),
            ]),
            VisemeCategory::Round => ShapeWeights::from_pairs(&[
                (LipsRound, 0.95),
                (LipsPurseNarrow, 0.6),
                (LipsOpenWide, 0.2),
                (LipsProtrude, 0.4),
                (TeethTongueOpen, 0.2),
            ]),
            VisemeCategory::TongueUp => ShapeWeights::from_pairs(&[
                (TeethTongueTipUp, 0.8),
                (TeethTongueBite, 0.35),
                (LipsWide, 0.4),
                (LipsOpenWide, 0.3),
            ]),
            VisemeCategory::Bite => ShapeWeights::from_pairs(&[
                (TeethTongueTipUp, 1.0),
                (LipsWide, 0.5),
                (TeethTongueBite, 1.0),
                (LipsOpenWide, 0.28),
                (LipsCornerUp, 0.2),
            ]),
            VisemeCategory::TeethOnLips => ShapeWeights::from_pairs(&[
                (LipsFv, 1.0),
                (LipsProtrude, 0.4),
                (LipsOpenWide, 0.2),
                (TeethTongueOpen, 0.25),
            ]),
            VisemeCategory::Neutral => ShapeWeights::zero(),
        }
    }
}

/// Per-phoneme weights, one entry per ARPABET phoneme.
#[rustfmt::skip]
fn builtin_phoneme_shapes() -> Vec<(&'static str, ShapeWeights)> {
    use ShapeKey::*;
    let w = ShapeWeights::from_pairs;
    vec![
        // vowels
        ("AA", w(&[(LipsOpenWide, 0.9), (LipsWide, 0.1), (TeethTongueOpen, 0.9), (LipsRound, 0.4), (LipsProtrude, 0.4)])),
        ("AE", w(&[(LipsWide, 0.7), (LipsOpenWide, 0.5), (LipsCornerUp, 0.2), (TeethTongueOpen, 0.6)])),
        ("AH", w(&[(LipsOpenWide, 0.6), (LipsRound, 0.1), (TeethTongueOpen, 0.7)])),
        ("AO", w(&[(LipsRound, 0.8), (LipsProtrude, 0.6), (LipsOpenWide, 0.4), (TeethTongueOpen, 0.5)])),
        ("AW", w(&[(LipsRound, 0.7), (LipsProtrude, 0.4), (LipsOpenWide, 0.5), (TeethTongueOpen, 0.6)])),
        ("AY", w(&[(LipsWide, 0.8), (LipsCornerUp, 0.3), (LipsOpenWide, 0.4), (TeethTongueOpen, 0.4)])),
        ("EH", w(&[(LipsWide, 0.7), (LipsOpenWide, 0.4), (LipsCornerUp, 0.2), (TeethTongueOpen, 0.5)])),
        ("ER", w(&[(LipsRound, 0.4), (LipsProtrude, 0.3), (LipsOpenWide, 0.3), (TeethTongueOpen, 0.4)])),
        ("EY", w(&[(LipsWide, 0.9), (LipsCornerUp, 0.4), (LipsOpenWide, 0.3), (TeethTongueOpen, 0.3)])),
        ("IH", w(&[(LipsWide, 0.8), (LipsCornerUp, 0.3), (LipsOpenWide, 0.3), (TeethTongueOpen, 0.3)])),
        ("IY", w(&[(LipsWide, 1.0), (LipsCornerUp, 0.5), (LipsOpenWide, 0.1), (TeethTongueOpen, 0.2)])),
        ("OW", w(&[(LipsRound, 0.5), (LipsProtrude, 0.6), (LipsOpenWide, 0.2), (TeethTongueOpen, 0.2)])),
        ("OY", w(&[(LipsRound, 0.6), (LipsProtrude, 0.5), (LipsWide, 0.2), (TeethTongueOpen, 0.4)])),
        ("UH", w(&[(LipsRound, 0.7), (LipsPurseNarrow, 0.5), (LipsOpenWide, 0.2), (TeethTongueOpen, 0.2)])),
        ("UW", w(&[(LipsRound, 0.7), (LipsProtrude, 0.9), (LipsPurseNarrow, 0.6), (TeethTongueOpen, 0.1)])),
        ("AX", w(&[(LipsOpenWide, 0.4), (LipsRound, 0.1), (TeethTongueOpen, 0.5)])),
        // plosives and labials
        ("B", w(&[(LipsPurseNarrow, 0.1), (LipsProtrude, 0.1)])),
        ("P", w(&[(LipsPurseNarrow, 0.1), (LipsProtrude, 0.2)])),
        ("M", w(&[(LipsPurseNarrow, 0.1), (LipsProtrude, 0.1)])),
        ("F", w(&[(LipsFv, 1.0), (LipsOpenWide, 0.1), (TeethTongueOpen, 0.1)])),
        ("V", w(&[(LipsFv, 1.0), (LipsOpenWide, 0.1), (TeethTongueOpen, 0.1)])),
        // sibilants
        ("S", w(&[(LipsWide, 0.8), (LipsOpenWide, 0.1), (TeethTongueTipUp, 0.4), (TeethTongueOpen, 0.05)])),
        ("Z", w(&[(LipsWide, 0.8), (LipsOpenWide, 0.1), (TeethTongueTipUp, 0.4), (TeethTongueOpen, 0.05)])),
        ("SH", w(&[(LipsProtrude, 0.8), (LipsOpenWide, 0.3), (LipsRound, 0.3), (TeethTongueOpen, 0.2)])),
        ("ZH", w(&[(LipsProtrude, 0.8), (LipsOpenWide, 0.3), (LipsRound, 0.3), (TeethTongueOpen, 0.2)])),
        ("CH", w(&[(LipsProtrude, 0.7), (LipsOpenWide, 0.4), (TeethTongueTipUp, 0.5), (TeethTongueOpen, 0.3)])),
        ("JH", w(&[(LipsProtrude, 0.7), (LipsOpenWide, 0.4), (TeethTongueTipUp, 0.5), (TeethTongueOpen, 0.3)])),
        // tongue
        ("TH", w(&[(LipsOpenWide, 1.0), (LipsWide, 0.3), (TeethTongueBite, 0.9), (TeethTongueOpen, 0.2)])),
        ("DH", w(&[(LipsOpenWide, 0.2), (LipsWide, 0.3), (TeethTongueBite, 0.9), (TeethTongueOpen, 0.2)])),
        ("T", w(&[(LipsWide, 0.3), (LipsOpenWide, 0.2), (TeethTongueTipUp, 0.9), (TeethTongueOpen, 0.2)])),
        ("D", w(&[(LipsWide, 0.3), (LipsOpenWide, 0.2), (TeethTongueTipUp, 0.8), (TeethTongueOpen, 0.2)])),
        ("L", w(&[(LipsOpenWide, 0.3), (TeethTongueTipUp, 1.0), (TeethTongueOpen, 0.4)])),
        ("N", w(&[(LipsOpenWide, 0.2), (TeethTongueTipUp, 0.9), (TeethTongueOpen, 0.2)])),
        // semi-vowels and back consonants
        ("R", w(&[(LipsRound, 0.5), (LipsProtrude, 0.4), (LipsOpenWide, 0.3), (TeethTongueOpen, 0.4)])),
        ("W", w(&[(LipsRound, 1.0), (LipsProtrude, 0.8), (TeethTongueOpen, 0.1)])),
        ("Y", w(&[(LipsWide, 0.8), (LipsCornerUp, 0.3), (TeethTongueOpen, 0.2)])),
        ("HH", w(&[(LipsOpenWide, 0.4), (TeethTongueOpen, 0.5)])),
        ("K", w(&[(LipsOpenWide, 0.4), (TeethTongueOpen, 0.6)])),
        ("G", w(&[(LipsOpenWide, 0.4), (TeethTongueOpen, 0.6)])),
        ("NG", w(&[(LipsOpenWide, 0.3), (TeethTongueOpen, 0.4)])),
    ]
}

/// Weights for pre-grouped phonemes, keyed by canonical group name.
#[rustfmt::skip]
fn builtin_group_shapes() -> Vec<(&'static str, ShapeWeights)> {
    use ShapeKey::*;
    let w = ShapeWeights::from_pairs;
    vec![
        ("OPEN", w(&[(TeethTongueOpen, 0.9), (LipsOpenWide, 0.8), (LipsRound, 0.2), (LipsWide, 0.1)])),
        ("WIDE", w(&[(LipsWide, 0.9), (LipsOpenWide, 0.5), (LipsCornerUp, 0.3), (TeethTongueOpen, 0.4)])),
        ("R", w(&[(LipsRound, 0.5), (LipsProtrude, 0.4), (LipsOpenWide, 0.4), (TeethTongueOpen, 0.5)])),
        ("ROUND", w(&[(LipsRound, 0.8), (LipsProtrude, 0.7), (LipsPurseNarrow, 0.4), (LipsOpenWide, 0.3), (TeethTongueOpen, 0.2)])),
        ("CLOSED", w(&[(LipsPurseNarrow, 0.2), (LipsProtrude, 0.1)])),
        ("FV", w(&[(LipsFv, 1.0), (TeethTongueBite, 0.6), (LipsOpenWide, 0.1), (TeethTongueOpen, 0.1)])),
        ("SIBILANT", w(&[(LipsOpenWide, 0.2), (LipsWide, 0.6), (TeethTongueTipUp, 0.4)])),
        ("DENTAL", w(&[(TeethTongueBite, 0.9), (LipsOpenWide, 0.2), (LipsWide, 0.3), (TeethTongueOpen, 0.2)])),
        ("ALVEOLAR", w(&[(LipsOpenWide, 0.3), (TeethTongueTipUp, 0.9), (TeethTongueOpen, 0.3), (LipsWide, 0.2)])),
        ("BACK", w(&[(LipsOpenWide, 0.5), (TeethTongueOpen, 0.6), (LipsRound, 0.1)])),
    ]
}

/// `true` for silence/pause markers.
pub fn is_silence_label(label: &str) -> bool {
    let label = label.trim();
    label.is_empty() || label.eq_ignore_ascii_case("sil") || label.eq_ignore_ascii_case("sp")
}

/// Strip everything but ASCII letters (stress digits, punctuation) and uppercase.
///
/// `"AA1"` becomes `"AA"`, `","` becomes `""`.
pub fn clean_phoneme(label: &str) -> String {
    label
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Canonical group name: `g1_OPEN` and `open` both become `OPEN`.
fn canonical_group(group: &str) -> String {
    let group = group.trim();
    let stripped = match group.split_once('_') {
        Some((prefix, rest))
            if prefix.len() > 1
                && prefix.starts_with(['g', 'G'])
                && prefix[1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            rest
        }
        _ => group,
    };
    stripped.to_ascii_uppercase()
}

type Resolver = fn(&ShapeTable, &str) -> Option<ShapeWeights>;

/// Lookup tables from phoneme or group labels to [`ShapeWeights`].
#[derive(Debug, Clone)]
pub struct ShapeTable {
    phonemes: HashMap<String, ShapeWeights>,
    groups: HashMap<String, ShapeWeights>,
}

impl Default for ShapeTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ShapeTable {
    const PHONEME_RESOLVERS: [Resolver; 3] = [
        Self::resolve_silence,
        Self::resolve_phoneme,
        Self::resolve_phoneme_category,
    ];

    const GROUP_RESOLVERS: [Resolver; 3] = [
        Self::resolve_silence,
        Self::resolve_group,
        Self::resolve_group_category,
    ];

    /// Tables tuned for the stock avatar.
    pub fn builtin() -> Self {
        Self {
            phonemes: builtin_phoneme_shapes()
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
            groups: builtin_group_shapes()
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
        }
    }

    /// Replace or add entries. Phoneme keys are cleaned, group keys canonicalised.
    pub fn with_overrides(
        mut self,
        phonemes: &BTreeMap<String, ShapeWeights>,
        groups: &BTreeMap<String, ShapeWeights>,
    ) -> Self {
        for (label, weights) in phonemes {
            self.phonemes.insert(clean_phoneme(label), *weights);
        }
        for (group, weights) in groups {
            self.groups.insert(canonical_group(group), *weights);
        }
        self
    }

    /// Weights for a single phoneme.
    ///
    /// Tries the per-phoneme table, then the phoneme's category, then
    /// falls back to silence.
    pub fn shapes_for_phoneme(&self, label: &str) -> ShapeWeights {
        Self::PHONEME_RESOLVERS
            .iter()
            .find_map(|resolve| resolve(self, label))
            .unwrap_or_else(|| {
                warn!(label, "unrecognised phoneme, using silence");
                ShapeWeights::zero()
            })
    }

    /// Weights for a phoneme group (`g1_OPEN`, `OPEN`, or a category name).
    pub fn shapes_for_group(&self, group: &str) -> ShapeWeights {
        Self::GROUP_RESOLVERS
            .iter()
            .find_map(|resolve| resolve(self, group))
            .unwrap_or_else(|| {
                warn!(group, "unrecognised viseme group, using silence");
                ShapeWeights::zero()
            })
    }

    /// Weights for a whole viseme category.
    pub fn shapes_for_category(&self, category: VisemeCategory) -> ShapeWeights {
        category.weights()
    }

    fn resolve_silence(&self, label: &str) -> Option<ShapeWeights> {
        is_silence_label(label).then(ShapeWeights::zero)
    }

    fn resolve_phoneme(&self, label: &str) -> Option<ShapeWeights> {
        let clean = clean_phoneme(label);
        if clean.is_empty() {
            return Some(ShapeWeights::zero());
        }
        self.phonemes.get(&clean).copied()
    }

    fn resolve_phoneme_category(&self, label: &str) -> Option<ShapeWeights> {
        VisemeCategory::for_phoneme(&clean_phoneme(label)).map(VisemeCategory::weights)
    }

    fn resolve_group(&self, group: &str) -> Option<ShapeWeights> {
        self.groups.get(&canonical_group(group)).copied()
    }

    fn resolve_group_category(&self, group: &str) -> Option<ShapeWeights> {
        VisemeCategory::from_name(group.trim()).map(VisemeCategory::weights)
    }
}
