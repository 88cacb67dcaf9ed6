use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    PutTrainer {
        id: TrainerId,
        name: String,
        /// `None` when both hour columns are NULL or absent.
        working_hours: Option<(NaiveTime, NaiveTime)>,
    },
    PutService {
        id: ServiceId,
        name: String,
        duration_minutes: u32,
        fee: Decimal,
    },
    PutMember {
        id: MemberId,
        name: String,
        principal: String,
    },
    InsertAppointment {
        /// Omitted by members booking for themselves.
        member_id: Option<MemberId>,
        trainer_id: TrainerId,
        service_id: ServiceId,
        start: Ms,
    },
    SetStatus {
        id: AppointmentId,
        status: AppointmentStatus,
    },
    CancelAppointment {
        id: AppointmentId,
    },
    SelectAppointments(AppointmentFilter),
    SelectAvailability {
        trainer_id: TrainerId,
        instant: Ms,
    },
    SelectAvailableTrainers {
        instant: Ms,
    },
    SelectStats,
    SelectTrainers,
    SelectServices,
    SelectMembers,
}

/// WHERE clause of `SELECT ... FROM appointments`. All present conditions must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppointmentFilter {
    pub id: Option<AppointmentId>,
    pub member_id: Option<MemberId>,
    pub trainer_id: Option<TrainerId>,
    pub status: Option<AppointmentStatus>,
    /// `start >= from`
    pub from: Option<Ms>,
    /// `"end" <= until`
    pub until: Option<Ms>,
    pub start_date_from: Option<NaiveDate>,
    pub start_date_until: Option<NaiveDate>,
}

impl AppointmentFilter {
    pub fn has_date_range(&self) -> bool {
        self.start_date_from.is_some() || self.start_date_until.is_some()
    }

    pub fn matches(&self, a: &Appointment) -> bool {
        let day = utc_date(a.span.start);
        self.id.is_none_or(|id| a.id == id)
            && self.member_id.is_none_or(|m| a.member_id == m)
            && self.trainer_id.is_none_or(|t| a.trainer_id == t)
            && self.status.is_none_or(|s| a.status == s)
            && self.from.is_none_or(|f| a.span.start >= f)
            && self.until.is_none_or(|u| a.span.end <= u)
            && self.start_date_from.is_none_or(|d| day >= d)
            && self.start_date_until.is_none_or(|d| day <= d)
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    parse_statement(stmt)
}

/// Every statement of a `;`-separated simple query, in order.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row layout a statement produces, known before its parameters are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Appointments,
    Availability,
    Stats,
    Trainers,
    Services,
    Members,
    /// Command tag only.
    None,
}

/// Describe a statement for the extended protocol. Placeholders are fine here;
/// only the statement kind and target table matter.
pub fn result_shape(sql: &str) -> ResultShape {
    let dialect = PostgreSqlDialect {};
    let Ok(stmts) = Parser::parse_sql(&dialect, sql) else {
        return ResultShape::None;
    };
    let table = match stmts.first() {
        Some(Statement::Insert(insert)) => match insert_table_name(insert) {
            Ok(t) if t == "appointments" => return ResultShape::Appointments,
            _ => return ResultShape::None,
        },
        Some(Statement::Query(query)) => match query.body.as_ref() {
            SetExpr::Select(s) if !s.from.is_empty() => table_factor_name(&s.from[0].relation),
            _ => return ResultShape::None,
        },
        _ => return ResultShape::None,
    };
    match table.as_deref() {
        Ok("appointments") => ResultShape::Appointments,
        Ok("availability") => ResultShape::Availability,
        Ok("appointment_stats") => ResultShape::Stats,
        Ok("trainers") | Ok("available_trainers") => ResultShape::Trainers,
        Ok("services") => ResultShape::Services,
        Ok("members") => ResultShape::Members,
        _ => ResultShape::None,
    }
}

/// INSERT values keyed by column name. Without a column list, values are taken
/// positionally against `columns`.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn new(insert: &ast::Insert, table: &'static str, columns: &[&str]) -> Result<Self, SqlError> {
        let exprs = extract_insert_values(insert)?;
        let names: Vec<String> = if insert.columns.is_empty() {
            columns.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if exprs.len() > names.len() {
            return Err(SqlError::WrongArity(table, names.len(), exprs.len()));
        }
        let mut values = HashMap::new();
        for (name, expr) in names.into_iter().zip(exprs) {
            if !columns.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(table, name));
            }
            values.insert(name, expr);
        }
        Ok(Self { table, values })
    }

    fn get(&self, column: &'static str) -> Option<&Expr> {
        self.values.get(column)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "trainers" => {
            let row = Row::new(insert, "trainers", &["id", "name", "work_start", "work_end"])?;
            let start = row.get("work_start").map(parse_time_or_null).transpose()?.flatten();
            let end = row.get("work_end").map(parse_time_or_null).transpose()?.flatten();
            let working_hours = match (start, end) {
                (Some(s), Some(e)) => Some((s, e)),
                (None, None) => None,
                _ => {
                    return Err(SqlError::Parse(
                        "work_start and work_end must both be set or both be NULL".into(),
                    ));
                }
            };
            Ok(Command::PutTrainer {
                id: parse_u64(row.require("id")?)?,
                name: parse_text(row.require("name")?)?,
                working_hours,
            })
        }
        "services" => {
            let row = Row::new(insert, "services", &["id", "name", "duration_minutes", "fee"])?;
            Ok(Command::PutService {
                id: parse_u64(row.require("id")?)?,
                name: parse_text(row.require("name")?)?,
                duration_minutes: parse_u32(row.require("duration_minutes")?)?,
                fee: parse_decimal(row.require("fee")?)?,
            })
        }
        "members" => {
            let row = Row::new(insert, "members", &["id", "name", "principal"])?;
            Ok(Command::PutMember {
                id: parse_u64(row.require("id")?)?,
                name: parse_text(row.require("name")?)?,
                principal: parse_text(row.require("principal")?)?,
            })
        }
        "appointments" => {
            let row = Row::new(
                insert,
                "appointments",
                &["member_id", "trainer_id", "service_id", "start"],
            )?;
            Ok(Command::InsertAppointment {
                member_id: row.get("member_id").map(parse_u64).transpose()?,
                trainer_id: parse_u64(row.require("trainer_id")?)?,
                service_id: parse_u64(row.require("service_id")?)?,
                start: parse_instant(row.require("start")?)?,
            })
        }
        "status_changes" => {
            let row = Row::new(insert, "status_changes", &["appointment_id", "status"])?;
            Ok(Command::SetStatus {
                id: parse_u64(row.require("appointment_id")?)?,
                status: parse_status(row.require("status")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "appointments" => Ok(Command::CancelAppointment {
            id: extract_where_id(&delete.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut conditions = Vec::new();
    if let Some(selection) = &select.selection {
        collect_conditions(selection, &mut conditions)?;
    }

    match table.as_str() {
        "appointments" => {
            let mut filter = AppointmentFilter::default();
            for (column, op, value) in conditions {
                match (column.as_str(), op) {
                    ("id", Op::Eq) => filter.id = Some(parse_u64(value)?),
                    ("member_id", Op::Eq) => filter.member_id = Some(parse_u64(value)?),
                    ("trainer_id", Op::Eq) => filter.trainer_id = Some(parse_u64(value)?),
                    ("status", Op::Eq) => filter.status = Some(parse_status(value)?),
                    ("start", Op::GtEq) => filter.from = Some(parse_instant(value)?),
                    ("end", Op::LtEq) => filter.until = Some(parse_instant(value)?),
                    ("start_date", Op::GtEq) => filter.start_date_from = Some(parse_date(value)?),
                    ("start_date", Op::LtEq) => filter.start_date_until = Some(parse_date(value)?),
                    (other, _) => return Err(SqlError::UnknownColumn("appointments", other.into())),
                }
            }
            Ok(Command::SelectAppointments(filter))
        }
        "availability" => {
            let (mut trainer_id, mut instant) = (None, None);
            for (column, op, value) in conditions {
                match (column.as_str(), op) {
                    ("trainer_id", Op::Eq) => trainer_id = Some(parse_u64(value)?),
                    ("instant", Op::Eq) => instant = Some(parse_instant(value)?),
                    (other, _) => return Err(SqlError::UnknownColumn("availability", other.into())),
                }
            }
            Ok(Command::SelectAvailability {
                trainer_id: trainer_id.ok_or(SqlError::MissingFilter("trainer_id"))?,
                instant: instant.ok_or(SqlError::MissingFilter("instant"))?,
            })
        }
        "available_trainers" => {
            let mut instant = None;
            for (column, op, value) in conditions {
                match (column.as_str(), op) {
                    ("instant", Op::Eq) => instant = Some(parse_instant(value)?),
                    (other, _) => {
                        return Err(SqlError::UnknownColumn("available_trainers", other.into()));
                    }
                }
            }
            Ok(Command::SelectAvailableTrainers {
                instant: instant.ok_or(SqlError::MissingFilter("instant"))?,
            })
        }
        "appointment_stats" | "trainers" | "services" | "members" => {
            if let Some((column, _, _)) = conditions.first() {
                return Err(SqlError::Unsupported(format!("filter on {table}.{column}")));
            }
            Ok(match table.as_str() {
                "appointment_stats" => Command::SelectStats,
                "trainers" => Command::SelectTrainers,
                "services" => Command::SelectServices,
                _ => Command::SelectMembers,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

/// Flatten an AND-chain of `column <op> value` comparisons.
fn collect_conditions<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, Op, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_conditions(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_conditions(left, out)?;
                    return collect_conditions(right, out);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((column, op, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("condition {other}"))),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<AppointmentId, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut conditions = Vec::new();
    collect_conditions(sel, &mut conditions)?;
    match conditions.as_slice() {
        [(column, Op::Eq, value)] if column == "id" => parse_u64(value),
        _ => Err(SqlError::MissingFilter("id")),
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

/// Numbers and quoted strings both carry their text through.
fn scalar_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected scalar, got {other}"))),
        None => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => Ok(format!("-{}", scalar_text(expr)?)),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    let s = scalar_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid id")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    let s = scalar_text(expr)?;
    Decimal::from_str(s.trim()).map_err(|e| SqlError::Parse(format!("bad amount {s}: {e}")))
}

fn parse_status(expr: &Expr) -> Result<AppointmentStatus, SqlError> {
    parse_text(expr)?
        .parse()
        .map_err(|e: UnknownStatus| SqlError::Parse(e.to_string()))
}

fn parse_time_or_null(expr: &Expr) -> Result<Option<NaiveTime>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let s = parse_text(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
        .map(Some)
        .map_err(|e| SqlError::Parse(format!("bad time of day {s}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

const NAIVE_INSTANT_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// RFC 3339, a zone-less `YYYY-MM-DD HH:MM[:SS]` read as UTC, or Unix milliseconds.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr) {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.timestamp_millis());
        }
        for format in NAIVE_INSTANT_FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
                return Ok(dt.and_utc().timestamp_millis());
            }
        }
        if let Ok(ms) = s.parse::<i64>() {
            return Ok(ms);
        }
        return Err(SqlError::Parse(format!("bad timestamp: {s}")));
    }
    parse_i64(expr)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
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
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column: {t}.{c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
