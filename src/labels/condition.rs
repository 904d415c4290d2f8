use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

pub const NUM_CONDITIONS: usize = 7;

/// The fixed set of skin conditions tracked by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Acne,
    Aging,
    FineLinesWrinkles,
    Hyperpigmentation,
    PoreSize,
    Redness,
    TexturedSkin,
}

impl Condition {
    pub const ALL: [Condition; NUM_CONDITIONS] = [
        Condition::Acne,
        Condition::Aging,
        Condition::FineLinesWrinkles,
        Condition::Hyperpigmentation,
        Condition::PoreSize,
        Condition::Redness,
        Condition::TexturedSkin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Condition::Acne              => "acne",
            Condition::Aging             => "aging",
            Condition::FineLinesWrinkles => "fine_lines_wrinkles",
            Condition::Hyperpigmentation => "hyperpigmentation",
            Condition::PoreSize          => "pore_size",
            Condition::Redness           => "redness",
            Condition::TexturedSkin      => "textured_skin",
        }
    }

    /// Title-cased name used in inference responses ("Fine Lines Wrinkles").
    pub fn display_name(self) -> String {
        self.as_str()
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The severity labels this condition is annotated with, in class-index
    /// order. Vocabularies differ between conditions; an index is only
    /// meaningful together with its condition.
    pub fn vocabulary(self) -> &'static [SeverityLevel] {
        use SeverityLevel::*;
        match self {
            Condition::Aging        => &[EarlySigns, Moderate, Advanced],
            Condition::TexturedSkin => &[Slight, Moderate, Severe],
            Condition::Acne
            | Condition::FineLinesWrinkles
            | Condition::Hyperpigmentation
            | Condition::PoreSize
            | Condition::Redness    => &[Mild, Moderate, Severe],
        }
    }

    /// Number of severity-head outputs: one per level plus the "absent" class.
    pub fn severity_classes(self) -> usize {
        self.vocabulary().len() + 1
    }

    fn position(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Condition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Condition::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown condition '{}'", s)))
    }
}

/// Every severity tag used anywhere in the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityLevel {
    Slight,
    Mild,
    Moderate,
    Severe,
    Advanced,
    EarlySigns,
}

impl SeverityLevel {
    pub const ALL: [SeverityLevel; 6] = [
        SeverityLevel::Slight,
        SeverityLevel::Mild,
        SeverityLevel::Moderate,
        SeverityLevel::Severe,
        SeverityLevel::Advanced,
        SeverityLevel::EarlySigns,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SeverityLevel::Slight     => "slight",
            SeverityLevel::Mild       => "mild",
            SeverityLevel::Moderate   => "moderate",
            SeverityLevel::Severe     => "severe",
            SeverityLevel::Advanced   => "advanced",
            SeverityLevel::EarlySigns => "early_signs",
        }
    }
}

impl fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeverityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        SeverityLevel::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown severity level '{}'", s)))
    }
}

/// A severity tag bound to the condition whose vocabulary it belongs to.
///
/// Construction fails for a level outside that vocabulary, so two conditions
/// can never share a class index by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSeverity {
    condition: Condition,
    level: SeverityLevel,
}

impl ConditionSeverity {
    pub fn new(condition: Condition, level: SeverityLevel) -> Option<Self> {
        condition
            .vocabulary()
            .contains(&level)
            .then_some(ConditionSeverity { condition, level })
    }

    /// Inverse of [`class_index`](Self::class_index). The absent class and
    /// out-of-range indices yield `None`.
    pub fn from_class_index(condition: Condition, index: usize) -> Option<Self> {
        condition
            .vocabulary()
            .get(index)
            .map(|&level| ConditionSeverity { condition, level })
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn level(&self) -> SeverityLevel {
        self.level
    }

    /// Position of the level inside its condition's vocabulary.
    pub fn class_index(&self) -> usize {
        self.condition
            .vocabulary()
            .iter()
            .position(|&l| l == self.level)
            .unwrap_or(0)
    }
}

/// A total mapping from every [`Condition`] to a value.
///
/// Lookups go through the condition identifier; serialized form is a JSON
/// object keyed by condition name so stored files never depend on ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionMap<T>([T; NUM_CONDITIONS]);

impl<T> ConditionMap<T> {
    pub fn from_fn<F: FnMut(Condition) -> T>(mut f: F) -> Self {
        ConditionMap(std::array::from_fn(|i| f(Condition::ALL[i])))
    }

    /// Like [`from_fn`](Self::from_fn), stopping at the first error.
    pub fn try_from_fn<E, F: FnMut(Condition) -> Result<T, E>>(mut f: F) -> Result<Self, E> {
        let mut values = Vec::with_capacity(NUM_CONDITIONS);
        for condition in Condition::ALL {
            values.push(f(condition)?);
        }
        let mut values = values.into_iter();
        Ok(ConditionMap::from_fn(|_| match values.next() {
            Some(value) => value,
            None => unreachable!("one value was produced per condition"),
        }))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Condition, &T)> {
        Condition::ALL.iter().copied().zip(self.0.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Condition, &mut T)> {
        Condition::ALL.iter().copied().zip(self.0.iter_mut())
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.0.iter_mut()
    }

    pub fn map<U, F: FnMut(Condition, &T) -> U>(&self, mut f: F) -> ConditionMap<U> {
        ConditionMap::from_fn(|c| f(c, &self[c]))
    }
}

impl<T: Default> Default for ConditionMap<T> {
    fn default() -> Self {
        ConditionMap::from_fn(|_| T::default())
    }
}

impl<T> Index<Condition> for ConditionMap<T> {
    type Output = T;

    fn index(&self, condition: Condition) -> &T {
        &self.0[condition.position()]
    }
}

impl<T> IndexMut<Condition> for ConditionMap<T> {
    fn index_mut(&mut self, condition: Condition) -> &mut T {
        &mut self.0[condition.position()]
    }
}

impl<T: Serialize> Serialize for ConditionMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(NUM_CONDITIONS))?;
        for (condition, value) in self.iter() {
            map.serialize_entry(&condition, value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for ConditionMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut entries: BTreeMap<Condition, T> = BTreeMap::deserialize(deserializer)?;
        let mut values = Vec::with_capacity(NUM_CONDITIONS);
        for condition in Condition::ALL {
            let value = entries
                .remove(&condition)
                .ok_or_else(|| D::Error::custom(format!("missing entry for condition '{}'", condition)))?;
            values.push(value);
        }
        let array: [T; NUM_CONDITIONS] = values
            .try_into()
            .map_err(|_| D::Error::custom("condition map has the wrong number of entries"))?;
        Ok(ConditionMap(array))
    }
}
