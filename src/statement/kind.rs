/// Coarse category of a SQL statement, derived from its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// `SELECT` or `WITH`.
    Select,
    /// `INSERT`, `UPDATE`, `REPLACE` or `DELETE`.
    Mutate,
    /// `ATTACH`.
    Attach,
    /// `BEGIN`.
    Begin,
    /// `COMMIT` or `END`.
    Commit,
    /// `ROLLBACK`.
    Rollback,
    /// `PRAGMA`.
    Pragma,
    /// `CREATE`, `DROP` or `ALTER`.
    Ddl,
    /// `ANALYZE` or `DETACH`; not worth caching.
    Unprepared,
    /// Anything else.
    Other,
}

impl StatementKind {
    /// Classifies `sql` by the first three significant characters after
    /// leading whitespace and comments.
    pub fn classify(sql: &str) -> StatementKind {
        let bytes = sql.as_bytes();
        let start = statement_start_index(sql);
        let Some(prefix) = bytes.get(start..start + 3) else {
            return StatementKind::Other;
        };
        let mut upper = [0u8; 3];
        for (dst, src) in upper.iter_mut().zip(prefix) {
            *dst = src.to_ascii_uppercase();
        }
        match &upper {
            b"SEL" | b"WIT" => StatementKind::Select,
            b"INS" | b"UPD" | b"REP" | b"DEL" => StatementKind::Mutate,
            b"ATT" => StatementKind::Attach,
            b"BEG" => StatementKind::Begin,
            b"COM" | b"END" => StatementKind::Commit,
            b"ROL" => StatementKind::Rollback,
            b"PRA" => StatementKind::Pragma,
            b"CRE" | b"DRO" | b"ALT" => StatementKind::Ddl,
            b"ANA" | b"DET" => StatementKind::Unprepared,
            _ => StatementKind::Other,
        }
    }

    /// Whether routing may assume the statement does not write.
    pub fn is_read_only(self) -> bool {
        self == StatementKind::Select
    }

    /// Begin, commit and rollback bypass prepare and bind.
    pub fn is_transaction_control(self) -> bool {
        matches!(
            self,
            StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback
        )
    }

    /// Whether the prepared form is worth keeping in the statement cache.
    pub fn is_cacheable(self) -> bool {
        matches!(self, StatementKind::Select | StatementKind::Mutate)
    }
}

/// Byte offset of the first character that is neither whitespace nor part
/// of a leading `--` or `/* */` comment. Returns `sql.len()` if there is none.
pub fn statement_start_index(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b if b.is_ascii_whitespace() => i += 1,
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = match bytes[i + 2..].iter().position(|&b| b == b'\n') {
                    Some(pos) => i + 2 + pos + 1,
                    None => bytes.len(),
                };
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = match bytes[i + 2..].windows(2).position(|w| w == b"*/") {
                    Some(pos) => i + 2 + pos + 2,
                    None => bytes.len(),
                };
            }
            _ => return i,
        }
    }
    bytes.len()
}
