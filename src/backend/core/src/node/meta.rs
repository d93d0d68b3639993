//! Decoding of metadata nodes.

/// A node that carries metadata rather than a permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaNode {
    /// `prefix.<priority>.<text>`
    Prefix { priority: i32, text: String },
    /// `suffix.<priority>.<text>`
    Suffix { priority: i32, text: String },
    /// `meta.<key>.<value>`, with `\.` escaping dots inside the key
    Meta { key: String, value: String },
    /// `weight.<n>`
    Weight(i32),
}

impl MetaNode {
    pub(crate) fn decode(permission: &str) -> Option<MetaNode> {
        let (kind, rest) = permission.split_once('.')?;
        match kind {
            "prefix" => chat_meta(rest).map(|(priority, text)| MetaNode::Prefix { priority, text }),
            "suffix" => chat_meta(rest).map(|(priority, text)| MetaNode::Suffix { priority, text }),
            "meta" => key_value(rest).map(|(key, value)| MetaNode::Meta { key, value }),
            "weight" => rest.parse().ok().map(MetaNode::Weight),
            _ => None,
        }
    }
}

fn chat_meta(rest: &str) -> Option<(i32, String)> {
    let (priority, text) = rest.split_once('.')?;
    let priority = priority.parse().ok()?;
    Some((priority, text.to_string()))
}

fn key_value(rest: &str) -> Option<(String, String)> {
    let mut key = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, '.')) => key.push('.'),
                Some((_, other)) => {
                    key.push('\\');
                    key.push(other);
                }
                None => return None,
            },
            '.' => {
                if key.is_empty() {
                    return None;
                }
                return Some((key.to_lowercase(), rest[i + 1..].to_string()));
            }
            _ => key.push(c),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_suffix() {
        assert_eq!(
            MetaNode::decode("prefix.100.[Admin] "),
            Some(MetaNode::Prefix { priority: 100, text: "[Admin] ".into() })
        );
        assert_eq!(
            MetaNode::decode("suffix.-5.a.b"),
            Some(MetaNode::Suffix { priority: -5, text: "a.b".into() })
        );
        assert_eq!(MetaNode::decode("prefix.high.x"), None);
        assert_eq!(MetaNode::decode("prefix.10"), None);
    }

    #[test]
    fn test_meta_key_escaping() {
        assert_eq!(
            MetaNode::decode("meta.home\\.limit.5.5"),
            Some(MetaNode::Meta { key: "home.limit".into(), value: "5.5".into() })
        );
        assert_eq!(MetaNode::decode("meta..x"), None);
        assert_eq!(MetaNode::decode("meta.novalue"), None);
    }

    #[test]
    fn test_weight() {
        assert_eq!(MetaNode::decode("weight.25"), Some(MetaNode::Weight(25)));
        assert_eq!(MetaNode::decode("weight.x"), None);
        assert_eq!(MetaNode::decode("essentials.fly"), None);
    }
}
