//! SQL text helpers.
//!
//! Identifier quoting, placeholder generation and the statement builders used
//! by `insert_data`, `update_data` and `delete_data`. Values never appear in
//! the generated text; they are always bound as parameters.

/// How a dialect quotes identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStyle {
    /// `` `name` `` (MySQL).
    Backtick,
    /// `"name"` (PostgreSQL, SQLite).
    DoubleQuote,
    /// `[name]` (SQL Server).
    Bracket,
}

/// How a dialect spells bind parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Dollar,
    /// `@P1`, `@P2`, ...
    AtP,
}

impl PlaceholderStyle {
    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            PlaceholderStyle::Question => "?".to_string(),
            PlaceholderStyle::Dollar => format!("${index}"),
            PlaceholderStyle::AtP => format!("@P{index}"),
        }
    }
}

/// How a dialect echoes mutated rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturningStyle {
    /// No row echo.
    None,
    /// Trailing `RETURNING *`.
    Returning,
    /// `OUTPUT INSERTED.*` / `OUTPUT DELETED.*` before `VALUES`/`WHERE`.
    Output,
}

/// Statement-building conventions of one SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlDialect {
    pub quote: QuoteStyle,
    pub placeholder: PlaceholderStyle,
    pub returning: ReturningStyle,
}

impl SqlDialect {
    pub const MYSQL: SqlDialect = SqlDialect {
        quote: QuoteStyle::Backtick,
        placeholder: PlaceholderStyle::Question,
        returning: ReturningStyle::None,
    };
    pub const POSTGRES: SqlDialect = SqlDialect {
        quote: QuoteStyle::DoubleQuote,
        placeholder: PlaceholderStyle::Dollar,
        returning: ReturningStyle::Returning,
    };
    pub const SQLITE: SqlDialect = SqlDialect {
        quote: QuoteStyle::DoubleQuote,
        placeholder: PlaceholderStyle::Question,
        returning: ReturningStyle::None,
    };
    pub const MSSQL: SqlDialect = SqlDialect {
        quote: QuoteStyle::Bracket,
        placeholder: PlaceholderStyle::AtP,
        returning: ReturningStyle::Output,
    };

    /// Quotes a single identifier, doubling any embedded closing quote.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self.quote {
            QuoteStyle::Backtick => format!("`{}`", ident.replace('`', "``")),
            QuoteStyle::DoubleQuote => format!("\"{}\"", ident.replace('"', "\"\"")),
            QuoteStyle::Bracket => format!("[{}]", ident.replace(']', "]]")),
        }
    }

    /// Quotes a possibly schema-qualified table name (`schema.table`).
    pub fn quote_table(&self, name: &str) -> String {
        name.split('.')
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `INSERT` for `rows` tuples of `columns`. Parameters are numbered row by
    /// row, column by column.
    pub fn insert(&self, table: &str, columns: &[String], rows: usize, returning: bool) -> String {
        let mut next = 0usize;
        let tuples = (0..rows)
            .map(|_| {
                let params = columns
                    .iter()
                    .map(|_| {
                        next += 1;
                        self.placeholder.placeholder(next)
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({params})")
            })
            .collect::<Vec<_>>()
            .join(", ");

        let head = format!(
            "INSERT INTO {} ({})",
            self.quote_table(table),
            self.column_list(columns)
        );
        match (returning, self.returning) {
            (true, ReturningStyle::Output) => format!("{head} OUTPUT INSERTED.* VALUES {tuples}"),
            (true, ReturningStyle::Returning) => format!("{head} VALUES {tuples} RETURNING *"),
            _ => format!("{head} VALUES {tuples}"),
        }
    }

    /// `UPDATE ... SET ... WHERE ...`. SET parameters come first, then WHERE
    /// parameters.
    pub fn update(
        &self,
        table: &str,
        set_columns: &[String],
        where_columns: &[String],
        returning: bool,
    ) -> String {
        let set_clause = self.equalities(set_columns, 1, ", ");
        let where_clause = self.equalities(where_columns, set_columns.len() + 1, " AND ");
        let table = self.quote_table(table);

        match (returning, self.returning) {
            (true, ReturningStyle::Output) => {
                format!("UPDATE {table} SET {set_clause} OUTPUT INSERTED.* WHERE {where_clause}")
            }
            (true, ReturningStyle::Returning) => {
                format!("UPDATE {table} SET {set_clause} WHERE {where_clause} RETURNING *")
            }
            _ => format!("UPDATE {table} SET {set_clause} WHERE {where_clause}"),
        }
    }

    /// `DELETE FROM ... WHERE ...`.
    pub fn delete(&self, table: &str, where_columns: &[String], returning: bool) -> String {
        let where_clause = self.equalities(where_columns, 1, " AND ");
        let table = self.quote_table(table);

        match (returning, self.returning) {
            (true, ReturningStyle::Output) => {
                format!("DELETE FROM {table} OUTPUT DELETED.* WHERE {where_clause}")
            }
            (true, ReturningStyle::Returning) => {
                format!("DELETE FROM {table} WHERE {where_clause} RETURNING *")
            }
            _ => format!("DELETE FROM {table} WHERE {where_clause}"),
        }
    }

    /// `col = $n` terms joined by `separator`, numbering from `first`.
    fn equalities(&self, columns: &[String], first: usize, separator: &str) -> String {
        columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                format!(
                    "{} = {}",
                    self.quote_ident(c),
                    self.placeholder.placeholder(first + i)
                )
            })
            .collect::<Vec<_>>()
            .join(separator)
    }
}

/// Rewrites positional `?` placeholders as `@P1`, `@P2`, ...
///
/// Question marks inside string literals, quoted or bracketed identifiers and
/// comments are left alone. Returns the rewritten text and the number of
/// placeholders found.
pub fn translate_positional(sql: &str) -> (String, usize) {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut count = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '?' => {
                count += 1;
                out.push_str(&PlaceholderStyle::AtP.placeholder(count));
            }
            '\'' | '"' | '[' => {
                let close = if c == '[' { ']' } else { c };
                out.push(c);
                while let Some(inner) = chars.next() {
                    out.push(inner);
                    if inner == close {
                        // A doubled closing character is an escape, not the end.
                        if chars.peek() == Some(&close) {
                            if let Some(escaped) = chars.next() {
                                out.push(escaped);
                            }
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                out.push(c);
                if let Some(star) = chars.next() {
                    out.push(star);
                }
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    out.push(inner);
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            _ => out.push(c),
        }
    }

    (out, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_quote_escapes_closing_character() {
        assert_eq!(SqlDialect::MYSQL.quote_ident("we`ird"), "`we``ird`");
        assert_eq!(SqlDialect::SQLITE.quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(SqlDialect::MSSQL.quote_ident("x]y"), "[x]]y]");
    }

    #[test]
    fn test_quote_table_splits_schema() {
        assert_eq!(SqlDialect::POSTGRES.quote_table("public.users"), "\"public\".\"users\"");
        assert_eq!(SqlDialect::MSSQL.quote_table("dbo.users"), "[dbo].[users]");
    }

    #[test]
    fn test_mysql_multi_row_insert() {
        let sql = SqlDialect::MYSQL.insert("users", &cols(&["name", "age"]), 2, false);
        assert_eq!(sql, "INSERT INTO `users` (`name`, `age`) VALUES (?, ?), (?, ?)");
    }

    #[test]
    fn test_postgres_insert_returning() {
        let sql = SqlDialect::POSTGRES.insert("users", &cols(&["name", "age"]), 1, true);
        assert_eq!(
            sql,
            "INSERT INTO \"users\" (\"name\", \"age\") VALUES ($1, $2) RETURNING *"
        );
    }

    #[test]
    fn test_mssql_insert_output() {
        let sql = SqlDialect::MSSQL.insert("users", &cols(&["name"]), 1, true);
        assert_eq!(sql, "INSERT INTO [users] ([name]) OUTPUT INSERTED.* VALUES (@P1)");
    }

    #[test]
    fn test_update_numbers_where_after_set() {
        let sql = SqlDialect::POSTGRES.update("t", &cols(&["a", "b"]), &cols(&["id", "k"]), false);
        assert_eq!(
            sql,
            "UPDATE \"t\" SET \"a\" = $1, \"b\" = $2 WHERE \"id\" = $3 AND \"k\" = $4"
        );
    }

    #[test]
    fn test_mssql_update_and_delete_output() {
        let update = SqlDialect::MSSQL.update("t", &cols(&["a"]), &cols(&["id"]), true);
        assert_eq!(update, "UPDATE [t] SET [a] = @P1 OUTPUT INSERTED.* WHERE [id] = @P2");
        let delete = SqlDialect::MSSQL.delete("t", &cols(&["id"]), true);
        assert_eq!(delete, "DELETE FROM [t] OUTPUT DELETED.* WHERE [id] = @P1");
    }

    #[test]
    fn test_returning_ignored_for_dialects_without_it() {
        let sql = SqlDialect::SQLITE.delete("t", &cols(&["id"]), true);
        assert_eq!(sql, "DELETE FROM \"t\" WHERE \"id\" = ?");
    }

    #[test]
    fn test_translate_positional() {
        let (sql, n) = translate_positional("SELECT * FROM t WHERE a = ? AND b > ?");
        assert_eq!(sql, "SELECT * FROM t WHERE a = @P1 AND b > @P2");
        assert_eq!(n, 2);
    }

    #[test]
    fn test_translate_skips_literals_and_comments() {
        let (sql, n) = translate_positional(
            "SELECT '?', 'it''s ?', [col?] FROM t -- why?\nWHERE x = ? /* ? */",
        );
        assert_eq!(
            sql,
            "SELECT '?', 'it''s ?', [col?] FROM t -- why?\nWHERE x = @P1 /* ? */"
        );
        assert_eq!(n, 1);
    }

    #[test]
    fn test_translate_leaves_named_parameters() {
        let (sql, n) = translate_positional("SELECT @P1");
        assert_eq!(sql, "SELECT @P1");
        assert_eq!(n, 0);
    }
}
