use pest_derive::Parser;

#[cfg(debug_assertions)]
const _GRAMMAR: &str = include_str!("btrfs.pest");

#[derive(Parser)]
#[grammar = "parsers/btrfs.pest"] // relative to src
pub struct BtrfsParser;

#[cfg(test)]
mod test {
    use super::{BtrfsParser, Rule};
    use pest::{consumes_to, parses_to, Parser};

    #[test]
    fn test_subvol_line() {
        let line = "ID 257 gen 9 top level 5 path containers/c1";

        parses_to! {
            parser: BtrfsParser,
            input: line,
            rule: Rule::subvol_line,
            tokens: [
                subvol_line(0, 43, [
                    number(3, 6),
                    number(11, 12),
                    number(23, 24),
                    subvol_path(30, 43)
                ])
            ]
        }
    }

    #[test]
    fn test_subvol_list() {
        let stdout = "ID 257 gen 9 top level 5 path containers/c1\n\
                      ID 258 gen 12 top level 257 path containers/c1/sub\n";

        let pairs = BtrfsParser::parse(Rule::subvol_list, stdout).unwrap();
        let lines: Vec<_> = pairs
            .flatten()
            .filter(|pair| pair.as_rule() == Rule::subvol_path)
            .map(|pair| pair.as_str())
            .collect();
        assert_eq!(vec!["containers/c1", "containers/c1/sub"], lines);
    }

    #[test]
    fn test_subvol_list_empty() {
        assert!(BtrfsParser::parse(Rule::subvol_list, "").is_ok());
        assert!(BtrfsParser::parse(Rule::subvol_list, "\n").is_ok());
    }

    #[test]
    fn test_qgroup_row() {
        let line = "0/257 16384 16384 1073741824 none";

        parses_to! {
            parser: BtrfsParser,
            input: line,
            rule: Rule::qgroup_row,
            tokens: [
                qgroup_row(0, 33, [
                    qgroup_id(0, 5),
                    qgroup_size(6, 11),
                    qgroup_size(12, 17),
                    qgroup_size(18, 28),
                    qgroup_size(29, 33)
                ])
            ]
        }
    }

    #[test]
    fn test_qgroup_table() {
        let stdout = "qgroupid         rfer         excl     max_rfer     max_excl\n\
                      --------         ----         ----     --------     --------\n\
                      0/5             16384        16384         none         none\n\
                      0/257           16384        16384   1073741824         none\n";

        let pairs = BtrfsParser::parse(Rule::qgroup_table, stdout).unwrap();
        let rows: Vec<_> = pairs
            .flatten()
            .filter(|pair| pair.as_rule() == Rule::qgroup_id)
            .map(|pair| pair.as_str())
            .collect();
        assert_eq!(vec!["0/5", "0/257"], rows);
    }
}
