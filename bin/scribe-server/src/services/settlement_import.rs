//! Settlement CSV importer for the Eastmoney (东方财富) export template.
//!
//! Files arrive as raw bytes in an unknown encoding (the broker exports
//! GB18030, re-saved copies are often UTF-8). Monetary cells are parsed as
//! exact decimal strings and stored as integer cents; binary floating point
//! never touches a currency value. Rows are deduplicated against both the
//! store and earlier rows of the same file, keyed by the broker serial
//! number when present and by a content hash otherwise, which makes
//! re-importing the same file idempotent.

use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{ImportBatchRecord, SettlementRecord, SettlementStore};

/// Header of the Eastmoney settlement export, in column order. Any
/// deviation rejects the whole file since parsing is positional.
pub const EXPECTED_HEADERS: [&str; 21] = [
    "交收日期",
    "发生日期",
    "发生时间",
    "证券代码",
    "证券名称",
    "交易类别",
    "成交数量",
    "成交均价",
    "成交金额",
    "发生金额",
    "佣金",
    "其他费用",
    "印花税",
    "过户费",
    "股份余额",
    "资金余额",
    "成交编号",
    "股东账号",
    "流水号",
    "交易市场",
    "币种",
];

/// Column index of 流水号, the broker-assigned serial number.
const SERIAL_NO_COLUMN: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Date,
    /// Yuan-denominated decimal, stored as integer cents.
    Money,
    Int,
    Text,
}

/// Parser routing per column, aligned with [`EXPECTED_HEADERS`].
const FIELD_KINDS: [FieldKind; 21] = [
    FieldKind::Date,  // 交收日期
    FieldKind::Date,  // 发生日期
    FieldKind::Text,  // 发生时间
    FieldKind::Text,  // 证券代码
    FieldKind::Text,  // 证券名称
    FieldKind::Text,  // 交易类别
    FieldKind::Int,   // 成交数量
    FieldKind::Money, // 成交均价
    FieldKind::Money, // 成交金额
    FieldKind::Money, // 发生金额
    FieldKind::Money, // 佣金
    FieldKind::Money, // 其他费用
    FieldKind::Money, // 印花税
    FieldKind::Money, // 过户费
    FieldKind::Int,   // 股份余额
    FieldKind::Money, // 资金余额
    FieldKind::Text,  // 成交编号
    FieldKind::Text,  // 股东账号
    FieldKind::Text,  // 流水号
    FieldKind::Text,  // 交易市场
    FieldKind::Text,  // 币种
];

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("csv file is empty")]
    Empty,

    #[error("csv header does not match the Eastmoney settlement template")]
    HeaderMismatch,

    #[error("malformed csv: {0}")]
    Malformed(#[from] csv::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// One typed, normalized cell value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cell {
    Null,
    Date(NaiveDate),
    Int(i64),
    Text(String),
}

impl Cell {
    fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Canonical string used for the content hash: dates as ISO-8601,
    /// integers as decimal strings, missing values as "".
    fn hash_repr(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Date(d) => d.format("%Y-%m-%d").to_string(),
            Cell::Int(n) => n.to_string(),
            Cell::Text(s) => s.clone(),
        }
    }

    fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Date(d) => Some(*d),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Cell::Int(n) => Some(*n),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Cell::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Import one settlement CSV file, persisting a batch record plus every
/// novel row, and return the batch with its final counts.
pub async fn import_settlement_csv<S: SettlementStore>(
    store: &S,
    file_bytes: &[u8],
    filename: &str,
) -> Result<ImportBatchRecord, ImportError> {
    let (text, encoding) = decode_csv_bytes(file_bytes);
    let rows = read_rows(&text)?;
    if rows.is_empty() {
        return Err(ImportError::Empty);
    }
    if !header_matches(&rows[0]) {
        return Err(ImportError::HeaderMismatch);
    }

    let mut batch = ImportBatchRecord {
        id: uuid::Uuid::new_v4().to_string(),
        filename: filename.to_owned(),
        file_hash: sha256_hex(file_bytes),
        row_count: (rows.len() - 1) as i64,
        imported_count: 0,
        skipped_count: 0,
        error_count: 0,
        encoding,
        created_at: Utc::now(),
    };
    store.insert_import_batch(batch.clone()).await?;

    let mut error_count: i64 = 0;
    let mut parsed_rows: Vec<(Vec<Cell>, String)> = Vec::new();
    for row in &rows[1..] {
        let cells = parse_row(row);
        if cells.iter().all(Cell::is_null) {
            error_count += 1;
            continue;
        }
        let row_hash = row_content_hash(&cells);
        parsed_rows.push((cells, row_hash));
    }

    let serials: Vec<String> = parsed_rows
        .iter()
        .filter_map(|(cells, _)| cells[SERIAL_NO_COLUMN].as_text())
        .collect();
    let hashes: Vec<String> = parsed_rows.iter().map(|(_, h)| h.clone()).collect();
    let existing_serials = store.existing_serials(&serials).await?;
    let existing_hashes = store.existing_hashes(&hashes).await?;

    // In-file de-dup runs before the store lookups so a file repeating a
    // row cannot insert it twice within one batch.
    let mut seen_serials: HashSet<String> = HashSet::new();
    let mut seen_hashes: HashSet<String> = HashSet::new();
    let mut skipped_count: i64 = 0;
    let mut records: Vec<SettlementRecord> = Vec::new();

    for (cells, row_hash) in parsed_rows {
        let serial_no = cells[SERIAL_NO_COLUMN].as_text();
        if let Some(serial) = &serial_no {
            if existing_serials.contains(serial) || !seen_serials.insert(serial.clone()) {
                skipped_count += 1;
                continue;
            }
        } else if existing_hashes.contains(&row_hash) || !seen_hashes.insert(row_hash.clone()) {
            skipped_count += 1;
            continue;
        }
        records.push(record_from_cells(&batch.id, cells, serial_no, row_hash));
    }

    store.insert_settlement_records(&records).await?;

    batch.imported_count = records.len() as i64;
    batch.skipped_count = skipped_count;
    batch.error_count = error_count;
    store
        .finalize_import_batch(
            &batch.id,
            batch.imported_count,
            batch.skipped_count,
            batch.error_count,
        )
        .await?;

    info!(
        filename,
        total = batch.row_count,
        imported = batch.imported_count,
        skipped = batch.skipped_count,
        errors = batch.error_count,
        "settlement import finished"
    );
    Ok(batch)
}

/// Decode the file into text. encoding_rs implements WHATWG GB18030, which
/// maps stray bytes such as a lone `0x80` instead of rejecting them, so a
/// GB18030-first order would silently turn UTF-8 input into mojibake. Valid
/// UTF-8 (BOM tolerated) therefore wins outright; everything else goes
/// through strict GB18030, with lossy GB18030 as the last resort rather
/// than rejecting the file.
fn decode_csv_bytes(file_bytes: &[u8]) -> (String, String) {
    let without_bom = file_bytes
        .strip_prefix(b"\xef\xbb\xbf")
        .unwrap_or(file_bytes);
    if let Ok(text) = std::str::from_utf8(without_bom) {
        return (text.to_owned(), "UTF-8-SIG".to_owned());
    }
    if let Some(text) =
        encoding_rs::GB18030.decode_without_bom_handling_and_without_replacement(file_bytes)
    {
        return (text.into_owned(), "GB18030".to_owned());
    }
    let (text, _, _) = encoding_rs::GB18030.decode(file_bytes);
    (text.into_owned(), "GB18030".to_owned())
}

fn read_rows(text: &str) -> Result<Vec<Vec<String>>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_owned).collect());
    }
    Ok(rows)
}

/// The header comparison tolerates surrounding and embedded whitespace in
/// each cell but nothing else.
fn header_matches(header_row: &[String]) -> bool {
    if header_row.len() != EXPECTED_HEADERS.len() {
        return false;
    }
    header_row
        .iter()
        .zip(EXPECTED_HEADERS)
        .all(|(cell, expected)| {
            cell.split_whitespace().collect::<String>() == expected
        })
}

/// Trim, then treat both the empty string and the export's `--` placeholder
/// as missing.
fn normalize_text(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() || value == "--" {
        None
    } else {
        Some(value)
    }
}

fn parse_row(row: &[String]) -> Vec<Cell> {
    FIELD_KINDS
        .iter()
        .enumerate()
        .map(|(idx, kind)| {
            let raw = row.get(idx).map(String::as_str).unwrap_or("");
            let Some(value) = normalize_text(raw) else {
                return Cell::Null;
            };
            match kind {
                FieldKind::Date => match parse_date(value) {
                    Some(date) => Cell::Date(date),
                    None => Cell::Null,
                },
                FieldKind::Money => match parse_cents(value) {
                    Some(cents) => Cell::Int(cents),
                    None => Cell::Null,
                },
                FieldKind::Int => match parse_int(value) {
                    Some(n) => Cell::Int(n),
                    None => Cell::Null,
                },
                FieldKind::Text => Cell::Text(value.to_owned()),
            }
        })
        .collect()
}

/// The export writes dates either slash- or dash-separated, without
/// zero-padding.
fn parse_date(value: &str) -> Option<NaiveDate> {
    for format in ["%Y/%m/%d", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    warn!(value, "unparseable date cell");
    None
}

/// Parse a yuan-denominated decimal string into integer cents, rounding
/// half away from zero on the third fractional digit. Stays in integer
/// arithmetic end to end.
fn parse_cents(value: &str) -> Option<i64> {
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        warn!(value, "unparseable money cell");
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        warn!(value, "unparseable money cell");
        return None;
    }

    let whole: i64 = if int_part.is_empty() {
        0
    } else {
        match int_part.parse() {
            Ok(n) => n,
            Err(_) => {
                warn!(value, "unparseable money cell");
                return None;
            }
        }
    };
    let mut frac = frac_part.chars();
    let tens = frac.next().and_then(|c| c.to_digit(10)).unwrap_or(0) as i64;
    let units = frac.next().and_then(|c| c.to_digit(10)).unwrap_or(0) as i64;
    let round_up = frac
        .next()
        .and_then(|c| c.to_digit(10))
        .map(|d| d >= 5)
        .unwrap_or(false);

    // Checked arithmetic keeps an absurdly large amount a soft row error
    // instead of a wrapped value or a debug-build panic.
    let cents = whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(tens * 10 + units))
        .and_then(|c| if round_up { c.checked_add(1) } else { Some(c) });
    let Some(cents) = cents else {
        warn!(value, "unparseable money cell");
        return None;
    };
    Some(if negative { -cents } else { cents })
}

/// Integer cells occasionally carry a decimal tail; truncate toward zero.
fn parse_int(value: &str) -> Option<i64> {
    let int_part = value.split_once('.').map(|(i, _)| i).unwrap_or(value);
    match int_part.parse::<i64>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(value, "unparseable integer cell");
            None
        }
    }
}

/// SHA-256 over the canonical cell representations joined with `|`.
fn row_content_hash(cells: &[Cell]) -> String {
    let joined = cells
        .iter()
        .map(Cell::hash_repr)
        .collect::<Vec<_>>()
        .join("|");
    sha256_hex(joined.as_bytes())
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn record_from_cells(
    batch_id: &str,
    cells: Vec<Cell>,
    serial_no: Option<String>,
    raw_row_hash: String,
) -> SettlementRecord {
    SettlementRecord {
        id: uuid::Uuid::new_v4().to_string(),
        batch_id: batch_id.to_owned(),
        settlement_date: cells[0].as_date(),
        trade_date: cells[1].as_date(),
        trade_time: cells[2].as_text(),
        symbol: cells[3].as_text(),
        symbol_name: cells[4].as_text(),
        trade_type: cells[5].as_text(),
        volume: cells[6].as_int(),
        price_cent: cells[7].as_int(),
        amount_cent: cells[8].as_int(),
        occur_amount_cent: cells[9].as_int(),
        commission_cent: cells[10].as_int(),
        other_fee_cent: cells[11].as_int(),
        stamp_tax_cent: cells[12].as_int(),
        transfer_fee_cent: cells[13].as_int(),
        share_balance: cells[14].as_int(),
        cash_balance_cent: cells[15].as_int(),
        deal_no: cells[16].as_text(),
        shareholder_account: cells[17].as_text(),
        serial_no,
        market: cells[19].as_text(),
        currency: cells[20].as_text(),
        raw_row_hash,
        created_at: Utc::now(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
