use unicode_segmentation::UnicodeSegmentation;
use unicode_width::UnicodeWidthStr;

const ELLIPSIS: char = '\u{2026}';

/// Terminal cells taken by `s`. CJK characters take two.
pub fn display_width(s: &str) -> usize {
    UnicodeWidthStr::width(s)
}

/// Cut `s` at a grapheme boundary so it fits in `max_cells`, ending with
/// `…` when anything was dropped.
pub fn truncate_to_width(s: &str, max_cells: usize) -> String {
    if display_width(s) <= max_cells {
        return s.to_string();
    }
    let Some(budget) = max_cells.checked_sub(1) else {
        return String::new();
    };
    let mut used = 0;
    let mut out: String = s
        .graphemes(true)
        .take_while(|g| {
            used += display_width(g);
            used <= budget
        })
        .collect();
    out.push(ELLIPSIS);
    out
}

/// Fit `s` into exactly `cells` columns: truncated if too wide, padded with
/// spaces otherwise. Used to align CJK tag names in table output.
pub fn pad_to_width(s: &str, cells: usize) -> String {
    let mut out = truncate_to_width(s, cells);
    let width = display_width(&out);
    out.extend(std::iter::repeat_n(' ', cells.saturating_sub(width)));
    out
}

/// Widest entry in cells, for sizing a column
pub fn column_width<'a>(items: impl IntoIterator<Item = &'a str>) -> usize {
    items.into_iter().map(display_width).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_tag_names_count_double() {
        assert_eq!(display_width("work"), 4);
        assert_eq!(display_width("工作"), 4);
        assert_eq!(display_width("#前端dev"), 8);
    }

    #[test]
    fn short_names_are_left_alone() {
        assert_eq!(truncate_to_width("ui", 10), "ui");
        assert_eq!(truncate_to_width("设计", 4), "设计");
    }

    #[test]
    fn long_names_get_an_ellipsis() {
        assert_eq!(truncate_to_width("deep work sessions", 8), "deep wo…");
        assert_eq!(truncate_to_width("前端开发", 5), "前端…");
        // a wide char never straddles the cut
        assert_eq!(truncate_to_width("前端开发", 4), "前…");
    }

    #[test]
    fn degenerate_widths() {
        assert_eq!(truncate_to_width("abc", 0), "");
        assert_eq!(truncate_to_width("abc", 1), "…");
    }

    #[test]
    fn pad_aligns_cjk_and_ascii() {
        assert_eq!(pad_to_width("设计", 6), "设计  ");
        assert_eq!(pad_to_width("ui", 6), "ui    ");
        assert_eq!(display_width(&pad_to_width("后端开发", 6)), 6);
    }

    #[test]
    fn column_width_takes_widest() {
        assert_eq!(column_width(["a", "工作", "abc"]), 4);
        assert_eq!(column_width(Vec::<&str>::new()), 0);
    }
}
