//! Line-oriented description of a single declarative class.
//!
//! ```text
//! # comment
//! global limit = 10
//! attr count = 0
//! attr doubled << count * 2
//! event clicked
//! const kind = 'button'
//! clicked ::
//!     self.count += 1
//! def reset(to=0):
//!     self.count = to
//! ```
//!
//! `attr`, `const` and `global` values are evaluated in the module namespace;
//! any other operator after `attr name` or a bare `name` binds the attribute.
//! Indented lines continue the preceding item.

use anyhow::{Context, Result, bail};

/// Binding operators, longest first so `::` is never read as `:`.
const OPERATORS: &[&str] = &[":=", "::", "<<", ">>", "="];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Global { name: String, source: String },
    Attr { name: String, default: Option<String> },
    Event { name: String },
    Const { name: String, source: String },
    /// `declare` is set for `attr name OPERATOR source`.
    Binding {
        name: String,
        operator: String,
        source: String,
        declare: bool,
    },
    Function { source: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub line: u32,
    pub item: Item,
}

pub fn parse(text: &str) -> Result<Vec<Located>> {
    let mut items: Vec<Located> = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index as u32 + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if raw.starts_with([' ', '\t']) {
            let Some(last) = items.last_mut() else {
                bail!("line {line}: indented line without a preceding item");
            };
            continue_item(&mut last.item, raw).with_context(|| format!("line {line}"))?;
            continue;
        }
        let item = parse_item(trimmed).with_context(|| format!("line {line}"))?;
        items.push(Located { line, item });
    }
    Ok(items)
}

fn continue_item(item: &mut Item, raw: &str) -> Result<()> {
    match item {
        Item::Function { source } => {
            source.push_str(raw);
            source.push('\n');
        }
        Item::Binding { operator, source, .. } if operator == "::" => {
            source.push_str(dedent(raw));
            source.push('\n');
        }
        _ => bail!("only `def` bodies and `::` blocks continue on indented lines"),
    }
    Ok(())
}

/// Strips the block indentation of `::` bodies (one level).
fn dedent(raw: &str) -> &str {
    raw.strip_prefix("    ")
        .or_else(|| raw.strip_prefix('\t'))
        .unwrap_or(raw.trim_start())
}

fn parse_item(line: &str) -> Result<Item> {
    if line.starts_with("def ") {
        return Ok(Item::Function {
            source: format!("{line}\n"),
        });
    }
    let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    match keyword {
        "event" => Ok(Item::Event {
            name: identifier(rest)?,
        }),
        "global" | "const" => {
            let Some((name, "=", source)) = split_binding(rest) else {
                bail!("expected `{keyword} name = expression`");
            };
            Ok(if keyword == "global" {
                Item::Global { name, source }
            } else {
                Item::Const { name, source }
            })
        }
        "attr" => match split_binding(rest) {
            None => Ok(Item::Attr {
                name: identifier(rest)?,
                default: None,
            }),
            Some((name, "=", source)) => Ok(Item::Attr {
                name,
                default: Some(source),
            }),
            Some((name, operator, source)) => Ok(Item::Binding {
                name,
                operator: operator.to_owned(),
                source: block_or_expression(operator, source),
                declare: true,
            }),
        },
        _ => match split_binding(line) {
            Some((name, operator, source)) => Ok(Item::Binding {
                name,
                operator: operator.to_owned(),
                source: block_or_expression(operator, source),
                declare: false,
            }),
            None => bail!("expected `name OPERATOR expression`"),
        },
    }
}

fn block_or_expression(operator: &str, source: String) -> String {
    if operator == "::" && !source.is_empty() {
        format!("{source}\n")
    } else {
        source
    }
}

fn split_binding(text: &str) -> Option<(String, &'static str, String)> {
    let end = text
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(text.len());
    let (name, rest) = text.split_at(end);
    let rest = rest.trim_start();
    let operator = OPERATORS.iter().find(|operator| rest.starts_with(**operator))?;
    if name.is_empty() {
        return None;
    }
    let source = rest[operator.len()..].trim().to_owned();
    Some((name.to_owned(), operator, source))
}

fn identifier(text: &str) -> Result<String> {
    if text.is_empty() || !text.chars().all(|c| c.is_alphanumeric() || c == '_') {
        bail!("expected an identifier, found `{text}`");
    }
    Ok(text.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_item_kind() {
        let text = "\
# widget
global limit = 10
attr count = 0
attr doubled << count * 2
event clicked
const kind = 'button'
clicked ::
    self.count += 1
    print(count)
def reset(to=0):
    self.count = to
";
        let items: Vec<Item> = parse(text).unwrap().into_iter().map(|item| item.item).collect();
        assert_eq!(
            items,
            vec![
                Item::Global {
                    name: "limit".into(),
                    source: "10".into()
                },
                Item::Attr {
                    name: "count".into(),
                    default: Some("0".into())
                },
                Item::Binding {
                    name: "doubled".into(),
                    operator: "<<".into(),
                    source: "count * 2".into(),
                    declare: true
                },
                Item::Event {
                    name: "clicked".into()
                },
                Item::Const {
                    name: "kind".into(),
                    source: "'button'".into()
                },
                Item::Binding {
                    name: "clicked".into(),
                    operator: "::".into(),
                    source: "self.count += 1\nprint(count)\n".into(),
                    declare: false
                },
                Item::Function {
                    source: "def reset(to=0):\n    self.count = to\n".into()
                },
            ]
        );
    }

    #[test]
    fn reports_the_offending_line() {
        let error = parse("attr ok\n  stray\n").unwrap_err();
        assert!(format!("{error:#}").contains("line 2"));
        assert!(parse("what is this\n").is_err());
    }
}
