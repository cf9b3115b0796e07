//! Schema declaration parsing.
//!
//! A module declares its columns once, during `create`/`connect`, with a
//! `CREATE TABLE`-shaped string. Only column names, declared types, a
//! single-column PRIMARY KEY, NOT NULL, and `WITHOUT ROWID` carry meaning;
//! the table name and every other constraint are ignored.
//!
//! A declared type containing the token `HIDDEN` (any case) marks the
//! column hidden; the token is removed from the stored type.

use vtbridge_error::{BridgeError, Result};
use vtbridge_types::TypeAffinity;

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// Declared type with the HIDDEN token removed.
    pub decl_type: String,
    pub hidden: bool,
    pub affinity: TypeAffinity,
    pub primary_key: bool,
    pub not_null: bool,
}

/// The parsed result of a schema declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    table_name: String,
    columns: Vec<ColumnDef>,
    without_rowid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Literal(String),
    Open,
    Close,
    Comma,
}

impl Token {
    fn text(&self) -> &str {
        match self {
            Self::Word(s) | Self::Quoted(s) | Self::Literal(s) => s,
            Self::Open => "(",
            Self::Close => ")",
            Self::Comma => ",",
        }
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Self::Word(w) if w.eq_ignore_ascii_case(kw))
    }
}

const COLUMN_CONSTRAINT_KEYWORDS: &[&str] = &[
    "CONSTRAINT",
    "PRIMARY",
    "NOT",
    "NULL",
    "UNIQUE",
    "CHECK",
    "DEFAULT",
    "COLLATE",
    "REFERENCES",
    "GENERATED",
    "AS",
];

const TABLE_CONSTRAINT_KEYWORDS: &[&str] = &["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"];

fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = sql.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '"' | '`' | '[' | '\'' => {
                chars.next();
                let close = if c == '[' { ']' } else { c };
                let mut text = String::new();
                let mut terminated = false;
                while let Some((_, ch)) = chars.next() {
                    if ch == close {
                        // Doubled quote is an escaped quote.
                        if close != ']' && chars.peek().is_some_and(|&(_, n)| n == close) {
                            chars.next();
                            text.push(close);
                            continue;
                        }
                        terminated = true;
                        break;
                    }
                    text.push(ch);
                }
                if !terminated {
                    return Err(BridgeError::schema(format!(
                        "unterminated quote at offset {start}"
                    )));
                }
                tokens.push(if c == '\'' {
                    Token::Literal(text)
                } else {
                    Token::Quoted(text)
                });
            }
            _ => {
                let mut word = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_whitespace() || "(),\"`['".contains(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

/// Split `tokens` at top-level commas.
fn split_top_level(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, tok) in tokens.iter().enumerate() {
        match tok {
            Token::Open => depth += 1,
            Token::Close => depth = depth.saturating_sub(1),
            Token::Comma if depth == 0 => {
                parts.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&tokens[start..]);
    parts
}

/// Render a run of type tokens back to text: `VARCHAR(12)`, `DECIMAL(10,2)`.
fn render_type(tokens: &[&Token]) -> String {
    let mut out = String::new();
    let mut prev: Option<&Token> = None;
    for tok in tokens {
        let glue = match (prev, tok) {
            (None, _)
            | (Some(_), Token::Open | Token::Close | Token::Comma)
            | (Some(Token::Open | Token::Comma), _) => "",
            _ => " ",
        };
        out.push_str(glue);
        out.push_str(tok.text());
        prev = Some(tok);
    }
    out
}

fn parse_column(tokens: &[Token]) -> Result<ColumnDef> {
    let (name_tok, rest) = tokens
        .split_first()
        .ok_or_else(|| BridgeError::schema("empty column definition"))?;
    let name = match name_tok {
        Token::Word(w) | Token::Quoted(w) => w.clone(),
        other => {
            return Err(BridgeError::schema(format!(
                "expected column name, found {:?}",
                other.text()
            )));
        }
    };

    let mut hidden = false;
    let mut type_tokens: Vec<&Token> = Vec::new();
    let mut depth = 0usize;
    let mut constraint_start = rest.len();
    for (i, tok) in rest.iter().enumerate() {
        if depth == 0
            && COLUMN_CONSTRAINT_KEYWORDS
                .iter()
                .any(|kw| tok.is_keyword(kw))
        {
            constraint_start = i;
            break;
        }
        match tok {
            Token::Open => depth += 1,
            Token::Close => depth = depth.saturating_sub(1),
            _ => {}
        }
        if depth == 0 && tok.is_keyword("HIDDEN") {
            hidden = true;
            continue;
        }
        type_tokens.push(tok);
    }

    let constraints = &rest[constraint_start..];
    let primary_key = constraints
        .windows(2)
        .any(|w| w[0].is_keyword("PRIMARY") && w[1].is_keyword("KEY"));
    let not_null = primary_key
        || constraints
            .windows(2)
            .any(|w| w[0].is_keyword("NOT") && w[1].is_keyword("NULL"));

    let decl_type = render_type(&type_tokens);
    Ok(ColumnDef {
        affinity: TypeAffinity::from_declared_type(&decl_type),
        name,
        decl_type,
        hidden,
        primary_key,
        not_null,
    })
}

/// Column names named by a table-level `PRIMARY KEY(...)` clause.
fn table_primary_key(tokens: &[Token]) -> Option<Vec<String>> {
    let pos = tokens
        .windows(2)
        .position(|w| w[0].is_keyword("PRIMARY") && w[1].is_keyword("KEY"))?;
    let rest = &tokens[pos + 2..];
    let open = rest.iter().position(|t| *t == Token::Open)?;
    let close = rest.iter().position(|t| *t == Token::Close)?;
    let inner = rest.get(open + 1..close)?;
    Some(
        split_top_level(inner)
            .into_iter()
            .filter_map(|part| match part.first() {
                Some(Token::Word(w) | Token::Quoted(w)) => Some(w.clone()),
                _ => None,
            })
            .collect(),
    )
}

impl TableSchema {
    /// Parse a `CREATE TABLE` declaration.
    pub fn parse(sql: &str) -> Result<Self> {
        let tokens = tokenize(sql)?;
        let mut pos = 0;
        let expect = |pos: &mut usize, kw: &str| -> Result<()> {
            if tokens.get(*pos).is_some_and(|t| t.is_keyword(kw)) {
                *pos += 1;
                Ok(())
            } else {
                Err(BridgeError::schema(format!(
                    "expected {kw} in schema declaration: {sql}"
                )))
            }
        };

        expect(&mut pos, "CREATE")?;
        if tokens
            .get(pos)
            .is_some_and(|t| t.is_keyword("TEMP") || t.is_keyword("TEMPORARY"))
        {
            pos += 1;
        }
        expect(&mut pos, "TABLE")?;
        if tokens.get(pos).is_some_and(|t| t.is_keyword("IF")) {
            expect(&mut pos, "IF")?;
            expect(&mut pos, "NOT")?;
            expect(&mut pos, "EXISTS")?;
        }
        let table_name = match tokens.get(pos) {
            Some(Token::Word(w) | Token::Quoted(w)) => w.clone(),
            _ => return Err(BridgeError::schema("missing table name")),
        };
        pos += 1;

        if tokens.get(pos) != Some(&Token::Open) {
            return Err(BridgeError::schema("expected ( after table name"));
        }
        let body_start = pos + 1;
        let mut depth = 0usize;
        let mut body_end = None;
        for (i, tok) in tokens.iter().enumerate().skip(pos) {
            match tok {
                Token::Open => depth += 1,
                Token::Close => {
                    depth -= 1;
                    if depth == 0 {
                        body_end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let body_end = body_end.ok_or_else(|| BridgeError::schema("unbalanced parentheses"))?;

        let trailer = &tokens[body_end + 1..];
        let without_rowid = match trailer {
            [] => false,
            [a, b] if a.is_keyword("WITHOUT") && b.is_keyword("ROWID") => true,
            _ => {
                return Err(BridgeError::schema(format!(
                    "unexpected text after column list: {sql}"
                )));
            }
        };

        let mut columns: Vec<ColumnDef> = Vec::new();
        let mut table_pk: Option<Vec<String>> = None;
        for part in split_top_level(&tokens[body_start..body_end]) {
            let Some(first) = part.first() else {
                return Err(BridgeError::schema("empty column definition"));
            };
            let is_table_constraint = TABLE_CONSTRAINT_KEYWORDS
                .iter()
                .any(|kw| first.is_keyword(kw));
            if is_table_constraint {
                if let Some(names) = table_primary_key(part) {
                    table_pk = Some(names);
                }
                continue;
            }
            let column = parse_column(part)?;
            if columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&column.name))
            {
                return Err(BridgeError::schema(format!(
                    "duplicate column name: {}",
                    column.name
                )));
            }
            columns.push(column);
        }

        if columns.is_empty() {
            return Err(BridgeError::schema("no columns declared"));
        }

        if let Some(names) = table_pk {
            let [name] = names.as_slice() else {
                return Err(BridgeError::schema(
                    "only a single-column PRIMARY KEY is supported",
                ));
            };
            let col = columns
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    BridgeError::schema(format!("PRIMARY KEY names unknown column {name}"))
                })?;
            col.primary_key = true;
            col.not_null = true;
        }

        let pk_count = columns.iter().filter(|c| c.primary_key).count();
        if pk_count > 1 {
            return Err(BridgeError::schema("table has more than one primary key"));
        }
        if without_rowid && pk_count == 0 {
            return Err(BridgeError::schema(format!(
                "PRIMARY KEY missing on table {table_name}"
            )));
        }

        Ok(Self {
            table_name,
            columns,
            without_rowid,
        })
    }

    /// The table name as written in the declaration (informational only).
    pub fn declared_name(&self) -> &str {
        &self.table_name
    }

    /// All columns in declaration order, hidden included.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Positional access; hidden columns are counted.
    pub fn column(&self, index: usize) -> Option<&ColumnDef> {
        self.columns.get(index)
    }

    /// Case-insensitive lookup by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub const fn without_rowid(&self) -> bool {
        self.without_rowid
    }

    /// Index of the PRIMARY KEY column, if declared.
    pub fn primary_key(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.primary_key)
    }

    /// The `INTEGER PRIMARY KEY` column of a rowid table, which names the
    /// rowid itself.
    pub fn rowid_alias(&self) -> Option<usize> {
        if self.without_rowid {
            return None;
        }
        self.primary_key()
            .filter(|&i| self.columns[i].decl_type.eq_ignore_ascii_case("INTEGER"))
    }

    /// Columns reported by schema introspection (hidden excluded).
    pub fn visible_columns(&self) -> Vec<&ColumnDef> {
        self.columns.iter().filter(|c| !c.hidden).collect()
    }

    /// Column indexes produced by `SELECT *`.
    pub fn star_columns(&self) -> Vec<usize> {
        self.visible_indexes()
    }

    /// Column indexes filled by an INSERT without a column list.
    pub fn implicit_insert_columns(&self) -> Vec<usize> {
        self.visible_indexes()
    }

    fn visible_indexes(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.hidden)
            .map(|(i, _)| i)
            .collect()
    }
}
