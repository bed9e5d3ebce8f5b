//! Turns one [`lib::layout::Row`] into a line of box-drawing glyphs, and
//! appends the branch name, remote-sync marker, CI status icons, and
//! unmerged count. The renderer is a collaborator the core hands its output
//! to; it knows nothing about cells, triggers, or the process runner.

use console::style;
use lib::ci::Status;
use lib::layout::Row;

const BOX_CHARS: [char; 16] = [
    ' ', '╵', '╶', '└', '╷', '│', '┌', '├', '╴', '┘', '─', '┴', '┐', '┤', '┬', '┼',
];

struct Bounds {
    min: usize,
    max: usize,
    cols: usize,
}

fn bounds(row: &Row) -> Bounds {
    let mut min = row.at;
    let mut max = row.at;
    for &idx in row.up.iter().chain(row.down.iter()) {
        min = min.min(idx);
        max = max.max(idx);
    }
    let mut cols_max = max;
    for &idx in &row.through {
        cols_max = cols_max.max(idx);
    }
    Bounds {
        min,
        max,
        cols: cols_max + 1,
    }
}

fn first_codepoint(row: &Row, bounds: &Bounds, column: usize) -> char {
    let (up, down, left, right) = if row.through.contains(&column) {
        (true, true, false, false)
    } else {
        let up = row.up.contains(&column);
        let down = row.down.contains(&column);
        if bounds.min == column && column == bounds.max {
            (up, down, true, true)
        } else {
            let left = bounds.min < column && column <= bounds.max;
            let right = bounds.min <= column && column < bounds.max;
            (up, down, left, right)
        }
    };
    let index = (up as usize) + (right as usize * 2) + (down as usize * 4) + (left as usize * 8);
    BOX_CHARS[index]
}

fn second_codepoint(row: &Row, bounds: &Bounds, column: usize) -> char {
    if column >= bounds.cols - 1 {
        return '\0';
    }
    if bounds.min <= column && column < bounds.max {
        if column + 1 == row.at {
            '▶'
        } else if column == row.at {
            '◀'
        } else if row.through.contains(&column) || row.through.contains(&(column + 1)) {
            '┄'
        } else {
            '─'
        }
    } else {
        ' '
    }
}

/// Renders a row's graph glyphs (without the trailing label).
pub fn render_row(row: &Row) -> String {
    let bounds = bounds(row);
    let mut out = String::new();
    for column in 0..bounds.cols {
        out.push(first_codepoint(row, &bounds, column));
        let second = second_codepoint(row, &bounds, column);
        if second != '\0' {
            out.push(second);
        }
    }
    out
}

fn status_icon(status: Status) -> console::StyledObject<&'static str> {
    match status {
        Status::Green => style("\u{1F49A}").green(),
        Status::Yellow => style("\u{231B}").yellow(),
        Status::Red => style("\u{1F525}").red(),
    }
}

/// Formats one full display line: graph glyphs, branch name (highlighted if
/// checked out), remote out-of-sync marker, CI status icons, unmerged count.
pub fn render_line(
    row: &Row,
    name: &str,
    is_head: bool,
    in_sync: Option<bool>,
    statuses: &[Status],
    unmerged: usize,
) -> String {
    let graph = render_row(row);
    let label = if is_head {
        style(name).bold().to_string()
    } else {
        name.to_string()
    };

    let mut line = format!("{graph}  {label}");

    if in_sync == Some(false) {
        line.push_str(&format!(" {}", style("[ahead/behind]").red()));
    }

    if !statuses.is_empty() {
        let icons: String = statuses.iter().map(|s| status_icon(*s).to_string()).collect();
        line.push(' ');
        line.push_str(&icons);
    }

    if unmerged > 0 {
        line.push_str(&format!(" {}", style(format!("({unmerged} unmerged)")).dim()));
    }

    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn row(at: usize, up: &[usize], down: &[usize], through: &[usize]) -> Row {
        Row {
            at,
            up: up.iter().copied().collect::<BTreeSet<_>>(),
            down: down.iter().copied().collect::<BTreeSet<_>>(),
            through: through.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn renders_a_simple_tip_row() {
        let r = row(0, &[], &[0], &[]);
        let glyphs = render_row(&r);
        assert!(!glyphs.is_empty());
    }

    #[test]
    fn crossover_row_includes_a_through_column() {
        let r = row(0, &[0], &[0], &[1]);
        let glyphs = render_row(&r);
        assert!(glyphs.chars().count() >= 2);
    }
}
