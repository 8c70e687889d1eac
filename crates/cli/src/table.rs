//! Borderless column-aligned tables for human output.

/// Render `rows` under `headers`, padding every column to its widest cell.
pub fn render(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) { *w = (*w).max(cell.chars().count()); }
        }
    }
    let line = |cells: Vec<&str>| -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{}{}", c, " ".repeat(w.saturating_sub(c.chars().count()))))
            .collect();
        padded.join("  ").trim_end().to_string()
    };
    let mut out = vec![line(headers.to_vec())];
    out.extend(rows.iter().map(|r| line(r.iter().map(String::as_str).collect())));
    out.join("\n")
}

/// `[a b c]`, the list style used in success messages.
pub fn bracketed(items: &[String]) -> String { format!("[{}]", items.join(" ")) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_align_on_widest_cell() {
        let out = render(&["", "RELEASE", "CURRENT", "WANTED"], &[
            vec!["✓".into(), "cert-manager".into(), "1.15.0".into(), "1.15.0".into()],
            vec!["✗".into(), "prometheus".into(), "".into(), "25.21.0".into()],
        ]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "   RELEASE       CURRENT  WANTED");
        assert_eq!(lines[1], "✓  cert-manager  1.15.0   1.15.0");
        assert_eq!(lines[2], "✗  prometheus             25.21.0");
    }

    #[test]
    fn bracketed_lists() {
        assert_eq!(bracketed(&["logs".into(), "traces".into()]), "[logs traces]");
        assert_eq!(bracketed(&[]), "[]");
    }
}
