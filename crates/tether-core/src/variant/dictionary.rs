//! Insertion-ordered variant dictionary

use super::Variant;

/// Key equality as the engine hashes keys: float keys match when equal or
/// when both are NaN.
fn same_key(a: &Variant, b: &Variant) -> bool {
    match (a, b) {
        (Variant::Float(x), Variant::Float(y)) => x == y || (x.is_nan() && y.is_nan()),
        _ => a == b,
    }
}

/// Dictionary preserving insertion order, like the engine's.
///
/// Lookups are linear; engine dictionaries crossing the boundary are small
/// and order matters more than lookup speed here.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dictionary {
    entries: Vec<(Variant, Variant)>,
}

impl Dictionary {
    /// Empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite. An existing key keeps its position.
    /// Returns the previous value.
    pub fn insert(&mut self, key: impl Into<Variant>, value: impl Into<Variant>) -> Option<Variant> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| same_key(k, &key)) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Value for a key
    pub fn get(&self, key: &Variant) -> Option<&Variant> {
        self.entries.iter().find(|(k, _)| same_key(k, key)).map(|(_, v)| v)
    }

    /// Value for a string key
    pub fn get_str(&self, key: &str) -> Option<&Variant> {
        self.entries
            .iter()
            .find(|(k, _)| matches!(k, Variant::String(s) if s == key))
            .map(|(_, v)| v)
    }

    /// Remove a key, shifting later entries down
    pub fn remove(&mut self, key: &Variant) -> Option<Variant> {
        let index = self.entries.iter().position(|(k, _)| same_key(k, key))?;
        Some(self.entries.remove(index).1)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the dictionary is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&Variant, &Variant)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl<K: Into<Variant>, V: Into<Variant>> FromIterator<(K, V)> for Dictionary {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dict = Dictionary::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

impl IntoIterator for Dictionary {
    type Item = (Variant, Variant);
    type IntoIter = std::vec::IntoIter<(Variant, Variant)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved() {
        let mut dict = Dictionary::new();
        dict.insert("z", 1i64);
        dict.insert("a", 2i64);
        dict.insert("m", 3i64);
        let keys: Vec<_> = dict.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![Variant::from("z"), Variant::from("a"), Variant::from("m")]);
    }

    #[test]
    fn test_overwrite_keeps_position() {
        let mut dict: Dictionary = [("a", 1i64), ("b", 2i64)].into_iter().collect();
        let old = dict.insert("a", 10i64);
        assert_eq!(old, Some(Variant::Int(1)));
        assert_eq!(dict.iter().next().unwrap().1, &Variant::Int(10));
        assert_eq!(dict.get_str("b"), Some(&Variant::Int(2)));
        assert_eq!(dict.remove(&Variant::from("a")), Some(Variant::Int(10)));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_nan_key_overwrites_instead_of_duplicating() {
        let mut dict = Dictionary::new();
        assert_eq!(dict.insert(f64::NAN, 1i64), None);
        assert_eq!(dict.insert(f64::NAN, 2i64), Some(Variant::Int(1)));
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get(&Variant::Float(f64::NAN)), Some(&Variant::Int(2)));

        dict.insert(0.0f64, "zero");
        dict.insert(-0.0f64, "negative zero");
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.remove(&Variant::Float(f64::NAN)), Some(Variant::Int(2)));
        assert_eq!(dict.len(), 1);
    }
}
