//! Parameter bindings and the space of values they are drawn from.

use std::collections::BTreeMap;
use std::fmt;

/// A concrete assignment of one string value to each bound parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binding {
    values: BTreeMap<String, String>,
}

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, "]")
    }
}

/// An ordered list of candidate values per parameter.
///
/// The Cartesian product of the value lists enumerates every [`Binding`]. A
/// parameter with an empty value list is suppressed: it simply does not
/// appear in any binding, which lets a run cover targets whose templates do
/// not mention every declared parameter.
#[derive(Debug, Clone, Default)]
pub struct ParameterSpace {
    axes: Vec<(String, Vec<String>)>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value list for a parameter, replacing any previous list.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<String>) -> &mut Self {
        let name = name.into();
        match self.axes.iter_mut().find(|(n, _)| *n == name) {
            Some(axis) => axis.1 = values,
            None => self.axes.push((name, values)),
        }
        self
    }

    /// Enumerates the Cartesian product of the non-empty value lists.
    ///
    /// Always yields at least one binding: with no parameters (or only empty
    /// value lists) the product is the single empty binding.
    pub fn bindings(&self) -> Bindings<'_> {
        let axes: Vec<_> = self.axes.iter().filter(|(_, v)| !v.is_empty()).collect();
        let cursor = vec![0; axes.len()];
        Bindings {
            axes,
            cursor,
            done: false,
        }
    }
}

/// Iterator over the bindings of a [`ParameterSpace`], last axis fastest.
pub struct Bindings<'a> {
    axes: Vec<&'a (String, Vec<String>)>,
    cursor: Vec<usize>,
    done: bool,
}

impl Iterator for Bindings<'_> {
    type Item = Binding;

    fn next(&mut self) -> Option<Binding> {
        if self.done {
            return None;
        }

        let mut binding = Binding::new();
        for (axis, &index) in self.axes.iter().zip(&self.cursor) {
            let (name, values) = axis;
            binding.set(name.clone(), values[index].clone());
        }

        // Advance the odometer; carry from the last axis towards the first.
        let mut position = self.axes.len();
        loop {
            if position == 0 {
                self.done = true;
                break;
            }
            position -= 1;
            self.cursor[position] += 1;
            if self.cursor[position] < self.axes[position].1.len() {
                break;
            }
            self.cursor[position] = 0;
        }

        Some(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn product_covers_every_combination() {
        let mut space = ParameterSpace::new();
        space.insert("a", values(&["1", "2"]));
        space.insert("b", values(&["x", "y"]));

        let rendered: Vec<String> = space.bindings().map(|b| b.to_string()).collect();
        assert_eq!(
            rendered,
            vec!["[a=1 b=x]", "[a=1 b=y]", "[a=2 b=x]", "[a=2 b=y]"]
        );
    }

    #[test]
    fn empty_value_list_suppresses_the_parameter() {
        let mut space = ParameterSpace::new();
        space.insert("a", values(&["1", "2"]));
        space.insert("b", values(&[]));

        let bindings: Vec<Binding> = space.bindings().collect();
        assert_eq!(bindings.len(), 2);
        assert!(bindings.iter().all(|b| b.get("b").is_none()));
    }

    #[test]
    fn empty_space_yields_one_empty_binding() {
        let bindings: Vec<Binding> = ParameterSpace::new().bindings().collect();
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].is_empty());
    }

    #[test]
    fn insert_replaces_existing_axis() {
        let mut space = ParameterSpace::new();
        space.insert("a", values(&["1"]));
        space.insert("a", values(&["2", "3"]));
        assert_eq!(space.bindings().count(), 2);
    }
}
