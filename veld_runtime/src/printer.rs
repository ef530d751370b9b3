//! Row printer for the Output operator
//!
//! Generated code prints one field at a time and ends each row with
//! `veld_print_newline`. Fields inside a row are comma-separated; the sink is
//! process stdout by default and an in-memory buffer when the host captures
//! output (tests, the `check` command).

use std::io::Write;
use std::sync::Mutex;

use crate::date;
use crate::string::StringView;

enum Sink {
    Stdout,
    Buffer(Vec<String>),
}

struct PrinterState {
    line: String,
    null_literal: String,
    sink: Sink,
}

static PRINTER: Mutex<PrinterState> = Mutex::new(PrinterState {
    line: String::new(),
    null_literal: String::new(),
    sink: Sink::Stdout,
});

fn append(field: &str) {
    let mut p = PRINTER.lock().unwrap();
    if !p.line.is_empty() {
        p.line.push(',');
    }
    p.line.push_str(field);
}

pub extern "C" fn veld_print_bool(v: bool) {
    append(if v { "t" } else { "f" });
}

pub extern "C" fn veld_print_i16(v: i16) {
    append(&v.to_string());
}

pub extern "C" fn veld_print_i32(v: i32) {
    append(&v.to_string());
}

pub extern "C" fn veld_print_i64(v: i64) {
    append(&v.to_string());
}

pub extern "C" fn veld_print_f64(v: f64) {
    append(&format!("{v:.2}"));
}

pub extern "C" fn veld_print_date(jd: i32) {
    let (y, m, d) = date::split(jd);
    append(&format!("{y:04}-{m:02}-{d:02}"));
}

pub unsafe extern "C" fn veld_print_string(s: *const StringView) {
    let bytes = if s.is_null() { &[][..] } else { (*s).as_bytes() };
    append(std::str::from_utf8(bytes).unwrap_or(""));
}

/// Substitutes the configured empty literal for a null field.
pub extern "C" fn veld_print_null() {
    let mut p = PRINTER.lock().unwrap();
    if !p.line.is_empty() {
        p.line.push(',');
    }
    let null = p.null_literal.clone();
    p.line.push_str(&null);
}

pub extern "C" fn veld_print_newline() {
    let mut p = PRINTER.lock().unwrap();
    let line = std::mem::take(&mut p.line);
    match &mut p.sink {
        Sink::Stdout => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            let _ = writeln!(handle, "{line}");
        }
        Sink::Buffer(rows) => rows.push(line),
    }
}

/// Host-side: set the literal printed for NULL fields.
pub fn set_null_literal(s: &str) {
    PRINTER.lock().unwrap().null_literal = s.to_string();
}

/// Host-side: capture all rows printed while `f` runs.
pub fn capture_output<T>(f: impl FnOnce() -> T) -> (T, Vec<String>) {
    {
        let mut p = PRINTER.lock().unwrap();
        p.sink = Sink::Buffer(Vec::new());
        p.line.clear();
    }
    let result = f();
    let mut p = PRINTER.lock().unwrap();
    let rows = match std::mem::replace(&mut p.sink, Sink::Stdout) {
        Sink::Buffer(rows) => rows,
        Sink::Stdout => Vec::new(),
    };
    (result, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The printer is process-global; capture tests must not interleave.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_row_formatting() {
        let _guard = TEST_LOCK.lock().unwrap();
        let ((), rows) = capture_output(|| {
            veld_print_i32(3);
            veld_print_i32(30);
            veld_print_newline();
            veld_print_f64(6.0);
            veld_print_newline();
            veld_print_null();
            veld_print_bool(true);
            veld_print_newline();
        });
        assert_eq!(rows, vec!["3,30", "6.00", ",t"]);
    }

    #[test]
    fn test_date_formatting() {
        let _guard = TEST_LOCK.lock().unwrap();
        let ((), rows) = capture_output(|| {
            veld_print_date(crate::date::build(2021, 6, 15));
            veld_print_newline();
        });
        assert_eq!(rows, vec!["2021-06-15"]);
    }
}
