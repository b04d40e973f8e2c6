//! Pure report-fragment formatting.
//!
//! Connectors and checks never build tabular markup ad hoc; every rendered
//! form comes out of this module so the report stays uniform. The output
//! dialect is AsciiDoc-flavored plain text: `|===` tables and admonition
//! blocks.

use serde_json::Value;

use crate::engine::operation::Row;

/// Renders an ordered sequence of row maps as a table. Column order is the
/// key order of the first row; later rows fill missing cells with blanks.
pub fn render_rows(rows: &[Row]) -> String {
    if rows.is_empty() {
        return render_note("No results returned.");
    }

    let columns: Vec<&String> = rows[0].keys().collect();
    let mut out = Vec::with_capacity(rows.len() + 3);
    out.push("|===".to_string());
    out.push(format!(
        "|{}",
        columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join("|")
    ));
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| row.get(*c).map(render_cell).unwrap_or_default())
            .collect();
        out.push(format!("|{}", cells.join("|")));
    }
    out.push("|===".to_string());
    out.join("\n")
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Renders a single-column attribute map ("Key: value" lines).
pub fn render_attributes(row: &Row) -> String {
    let mut out = Vec::with_capacity(row.len());
    for (key, value) in row {
        out.push(format!("{}: {}", key, render_cell(value)));
    }
    out.join("\n")
}

pub fn render_note(message: &str) -> String {
    format!("[NOTE]\n====\n{message}\n====\n")
}

pub fn render_warning(message: &str) -> String {
    format!("[WARNING]\n====\n{message}\n====\n")
}

pub fn render_critical(message: &str) -> String {
    format!("[CAUTION]\n====\n{message}\n====\n")
}

pub fn render_error(message: &str) -> String {
    format!("[ERROR]\n====\n{message}\n====\n")
}

pub fn render_important(message: &str) -> String {
    format!("[IMPORTANT]\n====\n{message}\n====\n")
}

pub fn render_literal(text: &str) -> String {
    format!("....\n{}\n....\n", text.trim_end())
}

/// Incremental builder for a check's report fragment.
#[derive(Default)]
pub struct FragmentBuilder {
    lines: Vec<String>,
}

impl FragmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn h3(&mut self, title: &str) -> &mut Self {
        self.lines.push(format!("=== {title}"));
        self.blank()
    }

    pub fn text(&mut self, line: impl Into<String>) -> &mut Self {
        self.lines.push(line.into());
        self
    }

    pub fn blank(&mut self) -> &mut Self {
        self.lines.push(String::new());
        self
    }

    pub fn note(&mut self, message: &str) -> &mut Self {
        self.text(render_note(message))
    }

    pub fn warning(&mut self, message: &str) -> &mut Self {
        self.text(render_warning(message))
    }

    pub fn critical(&mut self, message: &str) -> &mut Self {
        self.text(render_critical(message))
    }

    pub fn error(&mut self, message: &str) -> &mut Self {
        self.text(render_error(message))
    }

    pub fn important(&mut self, message: &str) -> &mut Self {
        self.text(render_important(message))
    }

    pub fn table(&mut self, rows: &[Row]) -> &mut Self {
        self.text(render_rows(rows))
    }

    pub fn build(&self) -> String {
        self.lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        let mut map = Row::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        map
    }

    #[test]
    fn test_render_rows_preserves_column_order() {
        let rows = vec![
            row(&[("topic", json!("orders")), ("partitions", json!(12))]),
            row(&[("topic", json!("events")), ("partitions", json!(3))]),
        ];
        let rendered = render_rows(&rows);
        assert_eq!(
            rendered,
            "|===\n|topic|partitions\n|orders|12\n|events|3\n|===",
            "columns must follow first-row key order"
        );
    }

    #[test]
    fn test_render_rows_empty_is_note() {
        assert!(render_rows(&[]).starts_with("[NOTE]"));
    }

    #[test]
    fn test_render_rows_missing_cell_is_blank() {
        let rows = vec![
            row(&[("a", json!(1)), ("b", json!(2))]),
            row(&[("a", json!(3))]),
        ];
        let rendered = render_rows(&rows);
        assert!(rendered.contains("|3|"), "missing cell renders as blank, got: {rendered}");
    }

    #[test]
    fn test_fragment_builder_shapes() {
        let mut b = FragmentBuilder::new();
        b.h3("Memory Usage").warning("2 nodes above threshold");
        let out = b.build();
        assert!(out.starts_with("=== Memory Usage\n"));
        assert!(out.contains("[WARNING]"));
    }
}
