use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const UNIT_SEPARATOR: char = '\u{1f}';
const SHIFT_OUT: char = '\u{0e}';

/// A set of strings that is comparable with `==` and `!=` and usable as a
/// map key. The default value is a valid, empty set.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Set {
    // The internal representation of a Set is formed by sorting its raw
    // elements, encoding each one, and concatenating them with the byte 0x1F
    // (the ASCII Unit Separator) as a separator.
    //
    // The per-element encoding has two forms. If the encoded element begins
    // with the byte 0x0E (the ASCII Shift Out), the remaining bytes are a
    // base64 encoding of the original raw element. Otherwise, the encoded
    // element is the original raw element.
    //
    // As a special case, the set containing only the empty string is
    // represented by the string containing only the separator byte.
    //
    // The representation of a particular set of elements is not guaranteed
    // to remain stable over time, and must not be stored or transmitted
    // outside of the process that created it.
    joined: String,
}

impl Set {
    /// Add the provided elements to the set if it does not already contain
    /// them; that is, make the set the union of its current elements and the
    /// elements provided.
    pub fn add<I>(&mut self, elems: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut all = self.to_vec();
        all.extend(elems.into_iter().map(Into::into));
        all.sort_unstable();
        all.dedup();

        if all.len() == 1 && all[0].is_empty() {
            self.joined = UNIT_SEPARATOR.to_string();
        } else {
            let encoded: Vec<String> = all.iter().map(|e| encode_element(e)).collect();
            self.joined = encoded.join("\u{1f}");
        }
    }

    /// The number of elements in the set. More efficient than counting the
    /// slice returned by [`Set::to_vec`].
    pub fn cardinality(&self) -> usize {
        if self.joined.is_empty() {
            0
        } else if self.joined == "\u{1f}" {
            1
        } else {
            1 + self.joined.matches(UNIT_SEPARATOR).count()
        }
    }

    /// Whether the set contains no elements.
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty()
    }

    /// The elements of the set as a sorted vector.
    pub fn to_vec(&self) -> Vec<String> {
        if self.joined.is_empty() {
            Vec::new()
        } else if self.joined == "\u{1f}" {
            vec![String::new()]
        } else {
            self.joined.split(UNIT_SEPARATOR).map(decode_element).collect()
        }
    }

    /// Iterate over the elements of the set in sorted order.
    pub fn iter(&self) -> std::vec::IntoIter<String> {
        self.to_vec().into_iter()
    }
}

impl<S: Into<String>> FromIterator<S> for Set {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Set::default();
        set.add(iter);
        set
    }
}

impl fmt::Debug for Set {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.to_vec()).finish()
    }
}

impl Serialize for Set {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.to_vec())
    }
}

impl<'de> Deserialize<'de> for Set {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let elems = Vec::<String>::deserialize(deserializer)?;
        let count = elems.len();
        let set: Set = elems.into_iter().collect();
        if set.cardinality() < count {
            return Err(D::Error::custom("duplicate elements in a set"));
        }
        Ok(set)
    }
}

// The per-element encoding is defined only in terms of the final encoded
// form, so encoding may be applied as narrowly as desired. It is applied in
// exactly the two cases where the representation requires it: a raw element
// containing a Unit Separator (which conflicts with the element separator)
// or starting with a Shift Out (which conflicts with the escape marker).
fn encode_element(elem: &str) -> String {
    if elem.contains(UNIT_SEPARATOR) || elem.starts_with(SHIFT_OUT) {
        let mut out = String::from(SHIFT_OUT);
        out.push_str(&STANDARD.encode(elem));
        out
    } else {
        elem.to_owned()
    }
}

fn decode_element(elem: &str) -> String {
    let Some(encoded) = elem.strip_prefix(SHIFT_OUT) else {
        return elem.to_owned();
    };
    let bytes = STANDARD
        .decode(encoded)
        .unwrap_or_else(|err| panic!("invalid set element encoding {encoded:?}: {err}"));
    String::from_utf8(bytes)
        .unwrap_or_else(|err| panic!("invalid set element encoding {encoded:?}: {err}"))
}
