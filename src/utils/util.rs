use comfy_table::Cell;

/// Renders tab-separated result lines as a table. Lines without a tab are
/// returned as they are.
pub fn pretty_format_lines(lines: &[&str]) -> Option<comfy_table::Table> {
    if lines.is_empty() || !lines.iter().all(|line| line.contains('\t')) {
        return None;
    }
    let mut table = comfy_table::Table::new();
    table.load_preset("||--+-++|    ++++++");
    table.set_header(vec![Cell::new("key"), Cell::new("value")]);
    for line in lines {
        let (key, value) = line.split_once('\t').unwrap_or((line, ""));
        table.add_row(vec![Cell::new(key), Cell::new(value)]);
    }
    Some(table)
}
