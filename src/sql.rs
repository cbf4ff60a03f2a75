use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Column order for INSERTs without a column list.
pub const RESERVATION_COLUMNS: [&str; 7] = [
    "client_id",
    "date",
    "slot_time",
    "services",
    "total",
    "phone",
    "contact_email",
];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation(ReservationRequest),
    CancelReservation {
        id: ReservationId,
        client_id: ClientId,
    },
    SelectOccupied {
        date: Option<String>,
    },
    SelectAvailable {
        date: String,
    },
    SelectClientReservations {
        client_id: ClientId,
    },
    SelectReservation {
        id: ReservationId,
        client_id: ClientId,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }

    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let values = &rows[0];

    let columns: Vec<String> = if insert.columns.is_empty() {
        RESERVATION_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity("reservations", columns.len(), values.len()));
    }

    let mut req = ReservationRequest::default();
    for (col, expr) in columns.iter().zip(values) {
        let text = value_text(expr)?;
        match col.as_str() {
            "client_id" => req.client_id = text,
            "date" => req.date = text,
            "slot_time" | "time" => req.slot_time = text,
            "services" => req.services = parse_services(&text),
            "total" => req.total = text,
            "phone" => req.phone = text,
            "contact_email" | "email" => req.contact_email = text,
            _ => return Err(SqlError::UnknownColumn(col.clone())),
        }
    }
    Ok(Command::InsertReservation(req))
}

/// A JSON array (`["corte","barba"]`) or a comma separated list.
pub fn parse_services(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.starts_with('[')
        && let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed)
    {
        return list;
    }
    trimmed
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::from_selection(delete.selection.as_ref())?;
    filters.allow_only(&["id", "client_id"])?;
    Ok(Command::CancelReservation {
        id: filters.reservation_id()?,
        client_id: filters.client_id()?,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "occupied" => {
            filters.allow_only(&["date"])?;
            Ok(Command::SelectOccupied {
                date: filters.get("date").map(str::to_string),
            })
        }
        "available" => {
            filters.allow_only(&["date"])?;
            Ok(Command::SelectAvailable {
                date: filters.require("date")?.to_string(),
            })
        }
        "reservations" => {
            filters.allow_only(&["id", "client_id"])?;
            let client_id = filters.client_id()?;
            if filters.get("id").is_some() {
                Ok(Command::SelectReservation {
                    id: filters.reservation_id()?,
                    client_id,
                })
            } else {
                Ok(Command::SelectClientReservations { client_id })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` terms of a WHERE clause joined by AND.
#[derive(Debug, Default)]
struct Filters {
    terms: Vec<(String, String)>,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    self.collect(left)?;
                    self.collect(right)
                }
                ast::BinaryOperator::Eq => {
                    let col = expr_column_name(left)
                        .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                    self.terms.push((col, value_text(right)?));
                    Ok(())
                }
                _ => Err(SqlError::Unsupported(format!("operator {op} in WHERE"))),
            },
            _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
        }
    }

    fn get(&self, col: &str) -> Option<&str> {
        self.terms
            .iter()
            .find(|(c, _)| c == col)
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, col: &'static str) -> Result<&str, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
    }

    fn allow_only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.terms.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::UnknownColumn(c.clone())),
            None => Ok(()),
        }
    }

    fn reservation_id(&self) -> Result<ReservationId, SqlError> {
        let raw = self.require("id")?;
        raw.trim()
            .parse()
            .map(ReservationId)
            .map_err(|_| SqlError::Parse(format!("bad reservation id: {raw:?}")))
    }

    fn client_id(&self) -> Result<ClientId, SqlError> {
        Ok(ClientId::new(self.require("client_id")?.trim()))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => Err(SqlError::Parse("empty VALUES".into())),
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// Literal as text. NULL reads as empty; validation decides whether that
/// is acceptable.
fn value_text(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(s.clone()),
            Value::Null => Ok(String::new()),
            _ => Err(SqlError::Parse(format!("expected string or number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(format!("-{}", value_text(expr)?))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_insert_reservation() {
        let sql = r#"INSERT INTO reservations (client_id, date, slot_time, services, total, phone, contact_email)
                     VALUES ('ana', '2025-03-10', '14:00:00', '["corte","barba"]', '70.00', '(11) 91234-5678', 'ana@example.com')"#;
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::InsertReservation(req) => {
                assert_eq!(req.client_id, "ana");
                assert_eq!(req.date, "2025-03-10");
                assert_eq!(req.slot_time, "14:00:00");
                assert_eq!(req.services, vec!["corte", "barba"]);
                assert_eq!(req.total, "70.00");
                assert_eq!(req.contact_email, "ana@example.com");
            }
            _ => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_positional_with_numeric_total() {
        let sql = "INSERT INTO reservations VALUES ('bia', '2025-03-11', '9:30', 'corte, sobrancelha', 45.5, '11999990000', NULL)";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::InsertReservation(req) => {
                assert_eq!(req.slot_time, "9:30");
                assert_eq!(req.services, vec!["corte", "sobrancelha"]);
                assert_eq!(req.total, "45.5");
                assert_eq!(req.contact_email, "");
            }
            _ => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_negative_total_kept_for_validation() {
        let sql = "INSERT INTO reservations VALUES ('bia', '2025-03-11', '09:30', 'corte', -5, '1', NULL)";
        match parse_sql(sql).unwrap() {
            Command::InsertReservation(req) => assert_eq!(req.total, "-5"),
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_arity_mismatch() {
        let sql = "INSERT INTO reservations (client_id, date) VALUES ('ana')";
        assert_eq!(
            parse_sql(sql),
            Err(SqlError::WrongArity("reservations", 2, 1))
        );
    }

    #[test]
    fn parse_insert_unknown_column() {
        let sql = "INSERT INTO reservations (client_id, barber) VALUES ('ana', 'joao')";
        assert_eq!(parse_sql(sql), Err(SqlError::UnknownColumn("barber".into())));
    }

    #[test]
    fn parse_cancel() {
        let sql = "DELETE FROM reservations WHERE id = 3 AND client_id = 'ana'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::CancelReservation {
                id: ReservationId(3),
                client_id: ClientId::new("ana"),
            }
        );
    }

    #[test]
    fn parse_cancel_requires_client() {
        let sql = "DELETE FROM reservations WHERE id = 3";
        assert_eq!(parse_sql(sql), Err(SqlError::MissingFilter("client_id")));
    }

    #[test]
    fn parse_cancel_rejects_extra_filters() {
        let sql = "DELETE FROM reservations WHERE id = 1 AND client_id = 'ana' AND date = '2025-03-10'";
        assert_eq!(parse_sql(sql), Err(SqlError::UnknownColumn("date".into())));
    }

    #[test]
    fn parse_select_occupied() {
        assert_eq!(
            parse_sql("SELECT * FROM occupied").unwrap(),
            Command::SelectOccupied { date: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM occupied WHERE date = '2025-03-10'").unwrap(),
            Command::SelectOccupied {
                date: Some("2025-03-10".into())
            }
        );
    }

    #[test]
    fn parse_select_available_needs_date() {
        assert_eq!(
            parse_sql("SELECT * FROM available WHERE date = '2025-03-11'").unwrap(),
            Command::SelectAvailable {
                date: "2025-03-11".into()
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM available"),
            Err(SqlError::MissingFilter("date"))
        );
    }

    #[test]
    fn parse_select_reservations() {
        assert_eq!(
            parse_sql("SELECT * FROM reservations WHERE client_id = 'ana'").unwrap(),
            Command::SelectClientReservations {
                client_id: ClientId::new("ana")
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM reservations WHERE (id = '7') AND client_id = 'ana'").unwrap(),
            Command::SelectReservation {
                id: ReservationId(7),
                client_id: ClientId::new("ana")
            }
        );
    }

    #[test]
    fn parse_bad_id() {
        let sql = "DELETE FROM reservations WHERE id = 'abc' AND client_id = 'ana'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_unsupported_filter() {
        let sql = "SELECT * FROM occupied WHERE date >= '2025-03-10'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
        let sql = "SELECT * FROM occupied WHERE client_id = 'ana'";
        assert_eq!(parse_sql(sql), Err(SqlError::UnknownColumn("client_id".into())));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = "SELECT * FROM barbers";
        assert_eq!(parse_sql(sql), Err(SqlError::UnknownTable("barbers".into())));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn services_fallback_to_comma_list() {
        assert_eq!(parse_services("[\"corte\"]"), vec!["corte"]);
        assert_eq!(parse_services("[not json"), vec!["[not json"]);
        assert!(parse_services("  ").is_empty());
    }
}
