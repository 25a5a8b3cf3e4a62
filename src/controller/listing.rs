//! Offset-token pagination for list calls

use crate::error::{Error, Result};

/// Parse a starting token; empty means the first page
pub fn parse_starting_token(token: &str) -> Result<usize> {
    if token.is_empty() {
        return Ok(0);
    }
    token.parse::<u32>().map(|v| v as usize).map_err(|e| {
        Error::Aborted(format!(
            "Unable to parse StartingToken: {} into uint32: {}",
            token, e
        ))
    })
}

/// Slice `[start, start + max_entries)` out of `items`
///
/// `max_entries` of zero means the rest of the set. The returned token is
/// empty when the page reaches the end, else the next offset.
pub fn paginate<T: Clone>(items: &[T], start: usize, max_entries: i32) -> Result<(Vec<T>, String)> {
    if max_entries < 0 {
        return Err(Error::InvalidArgument(format!(
            "max_entries must not be negative: {}",
            max_entries
        )));
    }
    if start > items.len() {
        return Err(Error::Aborted(format!(
            "startingToken={} > len(volumes)={}",
            start,
            items.len()
        )));
    }

    let remaining = items.len() - start;
    let take = match max_entries as usize {
        0 => remaining,
        n => n.min(remaining),
    };
    let end = start + take;
    let next = if end < items.len() {
        end.to_string()
    } else {
        String::new()
    };

    Ok((items[start..end].to_vec(), next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_pages_cover_whole_set() {
        let items: Vec<u32> = (0..7).collect();
        let mut seen = Vec::new();
        let mut token = String::new();

        loop {
            let start = parse_starting_token(&token).unwrap();
            let (page, next) = paginate(&items, start, 3).unwrap();
            seen.extend(page);
            if next.is_empty() {
                break;
            }
            token = next;
        }

        assert_eq!(seen, items);
    }

    #[test]
    fn test_zero_max_returns_rest() {
        let items = vec!["a", "b", "c"];
        let (page, next) = paginate(&items, 1, 0).unwrap();
        assert_eq!(page, vec!["b", "c"]);
        assert!(next.is_empty());
    }

    #[test]
    fn test_exact_end_has_empty_token() {
        let items = vec![1, 2, 3, 4];
        let (page, next) = paginate(&items, 2, 2).unwrap();
        assert_eq!(page, vec![3, 4]);
        assert_eq!(next, "");

        let (page, next) = paginate(&items, 4, 2).unwrap();
        assert!(page.is_empty());
        assert_eq!(next, "");
    }

    #[test]
    fn test_start_beyond_set_aborts() {
        let items = vec![1, 2];
        assert_matches!(paginate(&items, 3, 1), Err(Error::Aborted(_)));
    }

    #[test]
    fn test_bad_tokens() {
        assert_matches!(parse_starting_token("abc"), Err(Error::Aborted(_)));
        assert_matches!(parse_starting_token("-1"), Err(Error::Aborted(_)));
        assert_eq!(parse_starting_token("").unwrap(), 0);
        assert_eq!(parse_starting_token("12").unwrap(), 12);
        assert_matches!(paginate(&[1], 0, -1), Err(Error::InvalidArgument(_)));
    }
}
