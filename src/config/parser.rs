//! Configuration parser.
//!
//! Hand-written recursive descent over a character callback. The grammar:
//!
//! ```text
//! command_list := (command)*
//! command      := ident value_list '\n'
//! value        := integer | boolean | string | list | command_list | ref
//! integer      := [0-9][0-9a-fxX]*          # C strtoull, base 0
//! string       := '"' (char | '\' char)* '"'
//! list         := '[' value_list ']'
//! command_list := '{' command_list '}'
//! ref          := '$' ident
//! ident        := [A-Za-z0-9_]+
//! comment      := '#' .* '\n'
//! ```
//!
//! The parser tracks line and column for error reporting, and passes the current brace
//! nesting to the character source so interactive sources can adjust their prompt.

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::{Command, CommandList, Value, ValueList};
use crate::errors::ConfigError;

/// A character callback feeding the parser.
pub trait CharSource {
    /// Returns the next character, or `None` at end of input. `nesting` is the current
    /// `{}` depth: zero at top level.
    fn next_char(&mut self, nesting: u32) -> Option<char>;
}

/// In-memory character source.
pub struct StrSource<'a> {
    chars: core::str::Chars<'a>,
}

impl<'a> StrSource<'a> {
    pub fn new(s: &'a str) -> Self {
        Self { chars: s.chars() }
    }
}

impl CharSource for StrSource<'_> {
    fn next_char(&mut self, _nesting: u32) -> Option<char> {
        self.chars.next()
    }
}

/// Parses a whole configuration.
pub fn parse_source(source: &mut dyn CharSource) -> Result<CommandList, ConfigError> {
    let mut parser = Parser {
        source,
        peeked: None,
        line: 1,
        column: 1,
        nesting: 0,
    };
    parser.command_list(true)
}

/// Parses a configuration held in memory.
pub fn parse_str(input: &str) -> Result<CommandList, ConfigError> {
    parse_source(&mut StrSource::new(input))
}

struct Parser<'a> {
    source: &'a mut dyn CharSource,
    peeked: Option<char>,
    /// Position of the next unconsumed character, 1-based.
    line: u32,
    column: u32,
    nesting: u32,
}

impl Parser<'_> {
    fn peek(&mut self) -> Option<char> {
        if self.peeked.is_none() {
            self.peeked = self.source.next_char(self.nesting);
        }
        self.peeked
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peeked.take().or_else(|| self.source.next_char(self.nesting))?;

        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn fail<T>(&self, message: alloc::string::String) -> Result<T, ConfigError> {
        Err(ConfigError::new(message, self.line, self.column))
    }

    /// Skips spaces and tabs (not newlines, which terminate commands).
    fn skip_blank(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t') | Some('\r')) {
            self.next();
        }
    }

    /// Skips whitespace of every kind plus comments.
    fn skip_void(&mut self) {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') | Some('\n') => {
                    self.next();
                }
                Some('#') => {
                    while !matches!(self.peek(), Some('\n') | None) {
                        self.next();
                    }
                }
                _ => return,
            }
        }
    }

    fn ident(&mut self) -> Result<String, ConfigError> {
        let mut out = String::new();
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            out.push(self.next().expect("peeked"));
        }

        if out.is_empty() {
            let next = self.peek();
            return self.fail(alloc::format!("expected identifier, got {}", describe(next)));
        }
        Ok(out)
    }

    fn command_list(&mut self, top_level: bool) -> Result<CommandList, ConfigError> {
        let mut commands = Vec::new();

        loop {
            self.skip_void();

            match self.peek() {
                None if top_level => return Ok(commands),
                None => return self.fail(String::from("unexpected end of file in command list")),
                Some('}') if !top_level => {
                    self.next();
                    self.nesting -= 1;
                    return Ok(commands);
                }
                Some(_) => commands.push(self.command()?),
            }
        }
    }

    fn command(&mut self) -> Result<Command, ConfigError> {
        let (line, column) = (self.line, self.column);
        let name = self.ident()?;
        let mut args = ValueList::new();

        loop {
            self.skip_blank();
            match self.peek() {
                Some('\n') => {
                    self.next();
                    break;
                }
                Some('#') => {
                    while !matches!(self.peek(), Some('\n') | None) {
                        self.next();
                    }
                }
                None => break,
                Some(_) => args.push(self.value()?),
            }
        }

        Ok(Command {
            name,
            args,
            line,
            column,
        })
    }

    fn value(&mut self) -> Result<Value, ConfigError> {
        match self.peek() {
            Some(c) if c.is_ascii_digit() => self.integer(),
            Some('"') => self.string(),
            Some('[') => self.list(),
            Some('{') => {
                self.next();
                self.nesting += 1;
                Ok(Value::Commands(self.command_list(false)?))
            }
            Some('$') => {
                self.next();
                Ok(Value::Reference(self.ident()?))
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let word = self.ident()?;
                match word.as_str() {
                    "true" => Ok(Value::Boolean(true)),
                    "false" => Ok(Value::Boolean(false)),
                    _ => self.fail(alloc::format!("unexpected word '{word}'")),
                }
            }
            other => self.fail(alloc::format!("expected value, got {}", describe(other))),
        }
    }

    /// C `strtoull` with base 0: `0x` prefix is hexadecimal, a leading `0` octal,
    /// anything else decimal.
    fn integer(&mut self) -> Result<Value, ConfigError> {
        let mut digits = String::new();
        while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit() || c == 'x' || c == 'X') {
            digits.push(self.next().expect("peeked"));
        }

        let parsed = if let Some(hex) = digits.strip_prefix("0x").or(digits.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16)
        } else if digits.len() > 1 && digits.starts_with('0') {
            u64::from_str_radix(&digits[1..], 8)
        } else {
            digits.parse()
        };

        match parsed {
            Ok(value) => Ok(Value::Integer(value)),
            Err(_) => self.fail(alloc::format!("invalid integer literal '{digits}'")),
        }
    }

    fn string(&mut self) -> Result<Value, ConfigError> {
        self.next(); // opening quote

        let mut out = String::new();
        loop {
            match self.next() {
                Some('"') => return Ok(Value::String(out)),
                Some('\\') => match self.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    // Kept escaped: substitution treats `\$` as a literal dollar and
                    // suppresses expansion.
                    Some('$') => out.push_str("\\$"),
                    other => {
                        return self.fail(alloc::format!(
                            "invalid escape sequence '\\{}'",
                            describe(other)
                        ))
                    }
                },
                Some(c) => out.push(c),
                None => return self.fail(String::from("unterminated string")),
            }
        }
    }

    fn list(&mut self) -> Result<Value, ConfigError> {
        self.next(); // opening bracket

        let mut values = ValueList::new();
        loop {
            self.skip_void();
            match self.peek() {
                Some(']') => {
                    self.next();
                    return Ok(Value::List(values));
                }
                None => return self.fail(String::from("unterminated list")),
                Some(_) => values.push(self.value()?),
            }
        }
    }
}

fn describe(c: Option<char>) -> alloc::string::String {
    match c {
        Some('\n') => String::from("end of line"),
        Some(c) => alloc::format!("'{c}'"),
        None => String::from("end of file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    /// Structural equality; [`Value`]'s `PartialEq` only covers the primitive variants.
    fn value_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => x == y,
            (Value::Boolean(x), Value::Boolean(y)) => x == y,
            (Value::String(x), Value::String(y)) => x == y,
            (Value::Reference(x), Value::Reference(y)) => x == y,
            (Value::List(x), Value::List(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(a, b)| value_eq(a, b))
            }
            (Value::Commands(x), Value::Commands(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(a, b)| command_eq(a, b))
            }
            _ => false,
        }
    }

    fn command_eq(a: &Command, b: &Command) -> bool {
        a.name == b.name
            && a.args.len() == b.args.len()
            && a.args.iter().zip(&b.args).all(|(x, y)| value_eq(x, y))
    }

    #[test]
    fn parses_a_basic_configuration() {
        let cmds = parse_str(
            "# boot configuration\nset \"root\" \"hd0\"\nset \"n\" 3\nlinux \"/vmlinuz\" \"quiet\"\n",
        )
        .unwrap();

        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0].name, "set");
        assert!(value_eq(&cmds[0].args[1], &Value::String("hd0".into())));
        assert!(value_eq(&cmds[1].args[1], &Value::Integer(3)));
        assert_eq!(cmds[2].name, "linux");
        assert_eq!(cmds[2].line, 4);
    }

    #[test]
    fn integer_bases_follow_strtoull() {
        let cmds = parse_str("set \"a\" 10\nset \"b\" 0x10\nset \"c\" 010\nset \"d\" 0\n").unwrap();
        assert!(value_eq(&cmds[0].args[1], &Value::Integer(10)));
        assert!(value_eq(&cmds[1].args[1], &Value::Integer(16)));
        assert!(value_eq(&cmds[2].args[1], &Value::Integer(8)));
        assert!(value_eq(&cmds[3].args[1], &Value::Integer(0)));
    }

    #[test]
    fn nested_lists_and_command_lists() {
        let cmds = parse_str("entry \"test\" {\nset \"x\" [1 true \"s\" $y]\n}\n").unwrap();

        assert_eq!(cmds.len(), 1);
        let Value::Commands(inner) = &cmds[0].args[1] else {
            panic!("expected command list");
        };
        let Value::List(list) = &inner[0].args[1] else {
            panic!("expected list");
        };
        assert_eq!(list.len(), 4);
        assert!(value_eq(&list[3], &Value::Reference("y".into())));
    }

    #[test]
    fn errors_carry_the_source_location() {
        let err = parse_str("set \"a\" 1\nset % 2\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 5);

        let err = parse_str("set \"unterminated\n").unwrap_err();
        assert_eq!(err.line, 2);

        assert!(parse_str("entry {\nset \"x\" 1\n").is_err(), "missing brace");
    }

    #[test]
    fn escapes_in_strings() {
        let cmds = parse_str("set \"s\" \"a\\\"b\\\\c\\nd\\$e\"\n").unwrap();
        assert!(value_eq(
            &cmds[0].args[1],
            &Value::String("a\"b\\c\nd\\$e".into())
        ));
    }

    #[test]
    fn nesting_counter_reaches_the_source() {
        struct Tracking<'a> {
            inner: StrSource<'a>,
            max_nesting: u32,
        }
        impl CharSource for Tracking<'_> {
            fn next_char(&mut self, nesting: u32) -> Option<char> {
                self.max_nesting = self.max_nesting.max(nesting);
                self.inner.next_char(nesting)
            }
        }

        let mut source = Tracking {
            inner: StrSource::new("a {\nb {\nc\n}\n}\n"),
            max_nesting: 0,
        };
        parse_source(&mut source).unwrap();
        assert_eq!(source.max_nesting, 2);
    }

    #[test]
    fn unparse_then_parse_round_trips() {
        let input = concat!(
            "set \"root\" \"hd0\"\n",
            "set \"n\" 3\n",
            "set \"opts\" [1 0x10 true \"str with \\\"quotes\\\"\" $n]\n",
            "set \"cmdline\" \"root=${root} \\$HOME stays\"\n",
            "entry \"linux\" {\n",
            "linux \"/vmlinuz\" \"quiet\"\n",
            "}\n",
        );
        let parsed = parse_str(input).unwrap();

        let mut unparsed = alloc::string::String::new();
        for cmd in &parsed {
            unparsed.push_str(&cmd.to_string());
            unparsed.push('\n');
        }
        let reparsed = parse_str(&unparsed).unwrap();

        assert_eq!(parsed.len(), reparsed.len());
        for (a, b) in parsed.iter().zip(&reparsed) {
            assert!(command_eq(a, b), "round trip changed '{a}'");
        }
    }
}
