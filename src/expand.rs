//! Range-notation name expansion
//!
//! Cluster descriptions name hosts and ports compactly:
//! `orion-[01-08]-[10001-10128]` expands to 1024 names. A spec token is a
//! sequence of literal runs and bracket groups; a bracket group is a
//! comma list whose items are literals or zero-padded numeric ranges.
//! Multiple groups in one token expand as the Cartesian product in
//! left-to-right lexicographic order.

use thiserror::Error;

/// Errors from range-notation parsing
#[derive(Error, Debug, PartialEq)]
pub enum ExpandError {
    #[error("invalid name spec '{0}': {1}")]
    InvalidSpec(String, String),
}

/// One parsed segment of a spec token
enum Segment {
    Literal(String),
    Alternatives(Vec<String>),
}

/// Expand a single range-notation spec into its ordered name sequence.
///
/// Fails on malformed syntax or an empty expansion.
pub fn expand(spec: &str) -> Result<Vec<String>, ExpandError> {
    let segments = parse_segments(spec)?;

    let mut names = vec![String::new()];
    for segment in &segments {
        match segment {
            Segment::Literal(lit) => {
                for name in &mut names {
                    name.push_str(lit);
                }
            }
            Segment::Alternatives(alts) => {
                let mut next = Vec::with_capacity(names.len() * alts.len());
                for name in &names {
                    for alt in alts {
                        let mut n = name.clone();
                        n.push_str(alt);
                        next.push(n);
                    }
                }
                names = next;
            }
        }
    }

    if names.is_empty() || (names.len() == 1 && names[0].is_empty()) {
        return Err(ExpandError::InvalidSpec(
            spec.to_string(),
            "empty expansion".to_string(),
        ));
    }
    Ok(names)
}

/// Expand an ordered sequence of specs, concatenating in input order.
pub fn expand_all<S: AsRef<str>>(specs: &[S]) -> Result<Vec<String>, ExpandError> {
    let mut names = Vec::new();
    for spec in specs {
        names.extend(expand(spec.as_ref())?);
    }
    Ok(names)
}

fn parse_segments(spec: &str) -> Result<Vec<Segment>, ExpandError> {
    let err = |msg: &str| ExpandError::InvalidSpec(spec.to_string(), msg.to_string());

    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = spec.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '[' => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                let mut body = String::new();
                let mut closed = false;
                for gc in chars.by_ref() {
                    if gc == ']' {
                        closed = true;
                        break;
                    }
                    if gc == '[' {
                        return Err(err("nested '['"));
                    }
                    body.push(gc);
                }
                if !closed {
                    return Err(err("unbalanced '['"));
                }
                segments.push(Segment::Alternatives(expand_group(spec, &body)?));
            }
            ']' => return Err(err("unbalanced ']'")),
            _ => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Expand the body of one bracket group: a comma list of literals and
/// numeric ranges.
fn expand_group(spec: &str, body: &str) -> Result<Vec<String>, ExpandError> {
    let err = |msg: String| ExpandError::InvalidSpec(spec.to_string(), msg);

    if body.is_empty() {
        return Err(err("empty bracket group".to_string()));
    }

    let mut alts = Vec::new();
    for item in body.split(',') {
        if item.is_empty() {
            return Err(err("empty item in bracket group".to_string()));
        }
        match item.split_once('-') {
            Some((lo, hi)) if !lo.is_empty() && !hi.is_empty() => {
                let start: u64 = lo
                    .parse()
                    .map_err(|_| err(format!("non-numeric range start '{lo}'")))?;
                let end: u64 = hi
                    .parse()
                    .map_err(|_| err(format!("non-numeric range end '{hi}'")))?;
                if start > end {
                    return Err(err(format!("reversed range '{item}'")));
                }
                // Zero padding follows the start token: [01-08] stays
                // two digits wide, [9-11] does not pad.
                let width = if lo.starts_with('0') && lo.len() > 1 {
                    lo.len()
                } else {
                    0
                };
                for v in start..=end {
                    alts.push(format!("{v:0width$}"));
                }
            }
            _ => alts.push(item.to_string()),
        }
    }
    Ok(alts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_spec() {
        assert_eq!(expand("orion-01").unwrap(), vec!["orion-01"]);
    }

    #[test]
    fn test_numeric_range_zero_padded() {
        assert_eq!(
            expand("nid[0001-0003]").unwrap(),
            vec!["nid0001", "nid0002", "nid0003"]
        );
    }

    #[test]
    fn test_numeric_range_unpadded() {
        assert_eq!(expand("n[9-11]").unwrap(), vec!["n9", "n10", "n11"]);
    }

    #[test]
    fn test_comma_list() {
        assert_eq!(
            expand("host-[a,b,c]").unwrap(),
            vec!["host-a", "host-b", "host-c"]
        );
    }

    #[test]
    fn test_range_inside_comma_list() {
        assert_eq!(
            expand("n[1,3,5-7]").unwrap(),
            vec!["n1", "n3", "n5", "n6", "n7"]
        );
    }

    #[test]
    fn test_cartesian_product_order() {
        // Row-major: left group outer, right group inner
        assert_eq!(
            expand("nid[0001-0002]-[10001-10002]").unwrap(),
            vec![
                "nid0001-10001",
                "nid0001-10002",
                "nid0002-10001",
                "nid0002-10002",
            ]
        );
    }

    #[test]
    fn test_expand_all_concatenates_in_order() {
        let specs = ["b[1-2]", "a[1-2]"];
        assert_eq!(expand_all(&specs).unwrap(), vec!["b1", "b2", "a1", "a2"]);
    }

    #[test]
    fn test_unbalanced_brackets() {
        assert!(matches!(expand("n[1-2"), Err(ExpandError::InvalidSpec(_, _))));
        assert!(matches!(expand("n1-2]"), Err(ExpandError::InvalidSpec(_, _))));
    }

    #[test]
    fn test_empty_group() {
        assert!(expand("n[]").is_err());
        assert!(expand("n[1,,2]").is_err());
    }

    #[test]
    fn test_reversed_range() {
        assert!(expand("n[5-2]").is_err());
    }

    #[test]
    fn test_empty_spec() {
        assert!(expand("").is_err());
    }

    #[test]
    fn test_port_range() {
        let ports = expand("[10001-10004]").unwrap();
        assert_eq!(ports, vec!["10001", "10002", "10003", "10004"]);
    }
}
