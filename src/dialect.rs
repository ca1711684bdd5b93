//! DuckDB to SQLite dialect translation.
//!
//! Statements are tokenized first so string literals, quoted identifiers and
//! comments pass through untouched, and each token is rewritten at most once.
//! Type names are only rewritten where a type is expected: after a column name
//! in `CREATE`/`ALTER` statements, after `TYPE`, and after `AS` inside `CAST(`.

use std::borrow::Cow;

/// Engine type token → secondary store type token.
pub const TYPE_MAP: &[(&str, &str)] = &[
   ("UUID", "TEXT"),
   ("HUGEINT", "INTEGER"),
   ("UHUGEINT", "INTEGER"),
   ("BIGINT", "INTEGER"),
   ("UBIGINT", "INTEGER"),
   ("INT8", "INTEGER"),
   ("LONG", "INTEGER"),
   ("INTEGER", "INTEGER"),
   ("INT", "INTEGER"),
   ("INT4", "INTEGER"),
   ("INT2", "INTEGER"),
   ("UINTEGER", "INTEGER"),
   ("SMALLINT", "INTEGER"),
   ("USMALLINT", "INTEGER"),
   ("TINYINT", "INTEGER"),
   ("UTINYINT", "INTEGER"),
   ("BOOLEAN", "INTEGER"),
   ("BOOL", "INTEGER"),
   ("DOUBLE", "REAL"),
   ("FLOAT", "REAL"),
   ("FLOAT4", "REAL"),
   ("FLOAT8", "REAL"),
   ("REAL", "REAL"),
   ("DECIMAL", "REAL"),
   ("NUMERIC", "REAL"),
   ("VARCHAR", "TEXT"),
   ("CHAR", "TEXT"),
   ("BPCHAR", "TEXT"),
   ("STRING", "TEXT"),
   ("TEXT", "TEXT"),
   ("JSON", "TEXT"),
   ("TIMESTAMP", "TEXT"),
   ("TIMESTAMPTZ", "TEXT"),
   ("DATE", "TEXT"),
   ("TIME", "TEXT"),
   ("INTERVAL", "TEXT"),
   ("BLOB", "BLOB"),
   ("BYTEA", "BLOB"),
];

/// Zero-argument engine functions → equivalent store expressions.
pub const FUNCTION_MAP: &[(&str, &str)] = &[
   ("gen_random_uuid", "lower(hex(randomblob(16)))"),
   ("uuid", "lower(hex(randomblob(16)))"),
   ("now", "CURRENT_TIMESTAMP"),
];

/// Look up the store type for an engine type name, case-insensitively.
pub fn map_type(name: &str) -> Option<&'static str> {
   TYPE_MAP
      .iter()
      .find(|(from, _)| from.eq_ignore_ascii_case(name))
      .map(|(_, to)| *to)
}

fn map_function(name: &str) -> Option<&'static str> {
   FUNCTION_MAP
      .iter()
      .find(|(from, _)| from.eq_ignore_ascii_case(name))
      .map(|(_, to)| *to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
   Word,
   Number,
   StringLiteral,
   QuotedIdent,
   Whitespace,
   Comment,
   Punct,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
   kind: TokenKind,
   text: &'a str,
}

impl Token<'_> {
   fn is_keyword(&self, keyword: &str) -> bool {
      self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
   }

   fn is_punct(&self, punct: &str) -> bool {
      self.kind == TokenKind::Punct && self.text == punct
   }

   fn is_significant(&self) -> bool {
      !matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
   }

   fn is_name(&self) -> bool {
      matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
   }
}

fn scan_while(rest: &str, pred: impl Fn(char) -> bool) -> usize {
   rest
      .char_indices()
      .find(|(_, c)| !pred(*c))
      .map_or(rest.len(), |(i, _)| i)
}

/// Length of a quoted run starting at `rest[0]`, where a doubled quote escapes.
fn scan_quoted(rest: &str, quote: char) -> usize {
   let mut chars = rest.char_indices().skip(1).peekable();
   while let Some((i, c)) = chars.next() {
      if c == quote {
         if chars.peek().is_some_and(|(_, next)| *next == quote) {
            chars.next();
            continue;
         }
         return i + c.len_utf8();
      }
   }
   rest.len()
}

fn tokenize(sql: &str) -> Vec<Token<'_>> {
   let mut tokens = Vec::new();
   let mut pos = 0;

   while pos < sql.len() {
      let rest = &sql[pos..];
      let Some(c) = rest.chars().next() else {
         break;
      };

      let (kind, len) = if c.is_whitespace() {
         (TokenKind::Whitespace, scan_while(rest, char::is_whitespace))
      } else if rest.starts_with("--") {
         (TokenKind::Comment, rest.find('\n').unwrap_or(rest.len()))
      } else if rest.starts_with("/*") {
         let len = rest[2..].find("*/").map_or(rest.len(), |end| end + 4);
         (TokenKind::Comment, len)
      } else if c == '\'' {
         (TokenKind::StringLiteral, scan_quoted(rest, '\''))
      } else if c == '"' || c == '`' {
         (TokenKind::QuotedIdent, scan_quoted(rest, c))
      } else if c.is_alphabetic() || c == '_' {
         (
            TokenKind::Word,
            scan_while(rest, |ch| ch.is_alphanumeric() || ch == '_' || ch == '$'),
         )
      } else if c.is_ascii_digit() {
         (
            TokenKind::Number,
            scan_while(rest, |ch| ch.is_ascii_alphanumeric() || ch == '.'),
         )
      } else if rest.starts_with("::") {
         (TokenKind::Punct, 2)
      } else {
         (TokenKind::Punct, c.len_utf8())
      };

      tokens.push(Token {
         kind,
         text: &rest[..len],
      });
      pos += len;
   }

   tokens
}

/// Translate one engine statement into the secondary store's dialect.
///
/// Returns the input unchanged (borrowed) when nothing needed rewriting.
pub fn translate(sql: &str) -> Cow<'_, str> {
   let tokens = tokenize(sql);
   let significant: Vec<usize> = tokens
      .iter()
      .enumerate()
      .filter(|(_, t)| t.is_significant())
      .map(|(i, _)| i)
      .collect();
   let sig = |s: usize| significant.get(s).map(|&i| &tokens[i]);

   let is_ddl = sig(0).is_some_and(|t| t.is_keyword("CREATE") || t.is_keyword("ALTER"));

   let mut out = String::with_capacity(sql.len() + 16);
   let mut changed = false;
   let mut depth = 0usize;
   // Paren depths at which a CAST( was opened
   let mut cast_depths: Vec<usize> = Vec::new();
   let mut cursor = 0;
   let mut s = 0;

   while s < significant.len() {
      let ti = significant[s];
      for t in &tokens[cursor..ti] {
         out.push_str(t.text);
      }

      let token = &tokens[ti];
      let prev = s.checked_sub(1).and_then(sig);
      let prev2 = s.checked_sub(2).and_then(sig);
      let mut next = s + 1;

      match token.kind {
         TokenKind::Punct if token.is_punct("(") => {
            depth += 1;
            out.push_str(token.text);
         }
         TokenKind::Punct if token.is_punct(")") => {
            if cast_depths.last() == Some(&depth) {
               cast_depths.pop();
            }
            depth = depth.saturating_sub(1);
            out.push_str(token.text);
         }
         TokenKind::Word => {
            let is_call = sig(s + 1).is_some_and(|t| t.is_punct("("))
               && sig(s + 2).is_some_and(|t| t.is_punct(")"));

            let in_cast = cast_depths.last() == Some(&depth) && prev.is_some_and(|t| t.is_keyword("AS"));
            let in_column_def = is_ddl
               && prev.is_some_and(|t| {
                  t.is_name() && !t.is_keyword("TYPE") && !t.is_keyword("COLUMN") && !t.is_keyword("ADD")
               })
               && prev2.is_some_and(|t| {
                  t.is_punct("(") || t.is_punct(",") || t.is_keyword("COLUMN") || t.is_keyword("ADD")
               });
            let after_type_keyword = is_ddl && prev.is_some_and(|t| t.is_keyword("TYPE"));

            if is_call && let Some(expr) = map_function(token.text) {
               // SQLite only accepts expression defaults in parentheses
               if prev.is_some_and(|t| t.is_keyword("DEFAULT")) {
                  out.push('(');
                  out.push_str(expr);
                  out.push(')');
               } else {
                  out.push_str(expr);
               }
               next = s + 3;
               changed = true;
            } else if (in_cast || in_column_def || after_type_keyword)
               && let Some(mapped) = map_type(token.text)
            {
               if mapped.eq_ignore_ascii_case(token.text) {
                  out.push_str(token.text);
               } else {
                  out.push_str(mapped);
                  changed = true;
               }
               // Drop length/precision arguments such as VARCHAR(255)
               if let Some(close) = type_arguments_end(&tokens, &significant, s + 1) {
                  next = close + 1;
                  changed = true;
               }
            } else {
               if token.is_keyword("CAST") && sig(s + 1).is_some_and(|t| t.is_punct("(")) {
                  cast_depths.push(depth + 1);
               }
               out.push_str(token.text);
            }
         }
         _ => out.push_str(token.text),
      }

      cursor = significant[next - 1] + 1;
      s = next;
   }

   for t in &tokens[cursor..] {
      out.push_str(t.text);
   }

   if changed {
      Cow::Owned(out)
   } else {
      Cow::Borrowed(sql)
   }
}

/// If significant token `open` starts a `(n[, m])` argument list, returns the
/// significant index of its closing paren.
fn type_arguments_end(tokens: &[Token<'_>], significant: &[usize], open: usize) -> Option<usize> {
   let sig = |s: usize| significant.get(s).map(|&i| &tokens[i]);
   if !sig(open)?.is_punct("(") {
      return None;
   }
   let mut s = open + 1;
   loop {
      let token = sig(s)?;
      if token.is_punct(")") {
         return (s > open + 1).then_some(s);
      }
      if token.kind != TokenKind::Number && !token.is_punct(",") {
         return None;
      }
      s += 1;
   }
}
