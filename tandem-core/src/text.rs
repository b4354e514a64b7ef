//! Char-addressed helpers over UTF-8 strings.
//!
//! All positions in Tandem count Unicode scalar values, so every mutation
//! has to translate a char offset into a byte offset first.

/// Number of chars in `s`.
#[inline]
pub fn char_len(s: &str) -> usize {
    if s.is_ascii() {
        s.len()
    } else {
        s.chars().count()
    }
}

/// Byte offset of the char at `char_pos`, or `None` when out of bounds.
///
/// `char_pos == char_len(s)` maps to `s.len()`.
pub fn byte_offset(s: &str, char_pos: usize) -> Option<usize> {
    if s.is_ascii() {
        return (char_pos <= s.len()).then_some(char_pos);
    }
    let mut count = 0;
    for (byte, _) in s.char_indices() {
        if count == char_pos {
            return Some(byte);
        }
        count += 1;
    }
    (count == char_pos).then_some(s.len())
}

/// Insert `text` at char position `pos`. Returns false when out of bounds.
pub fn insert_at(s: &mut String, pos: usize, text: &str) -> bool {
    match byte_offset(s, pos) {
        Some(byte) => {
            s.insert_str(byte, text);
            true
        }
        None => false,
    }
}

/// Remove `len` chars starting at char position `pos`.
pub fn remove_range(s: &mut String, pos: usize, len: usize) -> bool {
    let Some(start) = byte_offset(s, pos) else {
        return false;
    };
    let Some(rel_end) = byte_offset(&s[start..], len) else {
        return false;
    };
    s.drain(start..start + rel_end);
    true
}

/// Split `s` into consecutive pieces of at most `size` chars.
///
/// An empty input yields a single empty piece.
pub fn split_chars(s: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    if s.is_empty() {
        return vec![String::new()];
    }
    let mut pieces = Vec::with_capacity(s.len() / size + 1);
    let mut start = 0;
    let mut count = 0;
    for (byte, _) in s.char_indices() {
        if count == size {
            pieces.push(s[start..byte].to_string());
            start = byte;
            count = 0;
        }
        count += 1;
    }
    pieces.push(s[start..].to_string());
    pieces
}

/// Absolute char offset of `(row, column)`.
///
/// Columns past the end of a line clamp to the line end; rows past the end
/// of the text clamp to the text length.
pub fn offset_of<'a>(
    pieces: impl IntoIterator<Item = &'a str>,
    row: usize,
    column: usize,
) -> usize {
    let mut offset = 0;
    let mut current_row = 0;
    let mut current_col = 0;
    for piece in pieces {
        for ch in piece.chars() {
            if current_row == row {
                if current_col == column || ch == '\n' {
                    return offset;
                }
                current_col += 1;
            } else if ch == '\n' {
                current_row += 1;
            }
            offset += 1;
        }
    }
    offset
}

/// `(row, column)` of the absolute char offset `offset`.
pub fn row_col<'a>(pieces: impl IntoIterator<Item = &'a str>, offset: usize) -> (usize, usize) {
    let mut row = 0;
    let mut col = 0;
    let mut seen = 0;
    for piece in pieces {
        for ch in piece.chars() {
            if seen == offset {
                return (row, col);
            }
            if ch == '\n' {
                row += 1;
                col = 0;
            } else {
                col += 1;
            }
            seen += 1;
        }
    }
    (row, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_offset_multibyte() {
        let s = "aé漢b";
        assert_eq!(byte_offset(s, 0), Some(0));
        assert_eq!(byte_offset(s, 1), Some(1));
        assert_eq!(byte_offset(s, 2), Some(3));
        assert_eq!(byte_offset(s, 3), Some(6));
        assert_eq!(byte_offset(s, 4), Some(7));
        assert_eq!(byte_offset(s, 5), None);
    }

    #[test]
    fn test_insert_and_remove() {
        let mut s = String::from("héllo");
        assert!(insert_at(&mut s, 2, "XY"));
        assert_eq!(s, "héXYllo");
        assert!(remove_range(&mut s, 1, 3));
        assert_eq!(s, "hllo");
        assert!(!remove_range(&mut s, 3, 5));
        assert!(!insert_at(&mut s, 9, "z"));
    }

    #[test]
    fn test_split_chars() {
        assert_eq!(split_chars("abcdefg", 3), vec!["abc", "def", "g"]);
        assert_eq!(split_chars("", 3), vec![""]);
        assert_eq!(split_chars("ééé", 2), vec!["éé", "é"]);
    }

    #[test]
    fn test_row_col_roundtrip() {
        let text = "ab\ncde\n\nf";
        for offset in 0..=char_len(text) {
            let (row, col) = row_col([text], offset);
            assert_eq!(offset_of([text], row, col), offset);
        }
    }

    #[test]
    fn test_offset_of_clamps() {
        let text = "ab\ncd";
        assert_eq!(offset_of([text], 0, 10), 2);
        assert_eq!(offset_of([text], 5, 0), 5);
    }

    #[test]
    fn test_positions_across_pieces() {
        let pieces = ["ab\n", "c", "d\ne"];
        assert_eq!(row_col(pieces, 4), (1, 1));
        assert_eq!(offset_of(pieces, 2, 0), 6);
    }
}
