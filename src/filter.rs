use log::warn;
use serde::{Deserialize, Serialize};
use crate::error::{BackupError, Result};

/// Schemas kept out of every data or schema dump; grants travel in the `.priv` file instead.
pub const DUMP_EXCLUDE_DBS: [&str; 5] = ["mysql", "sys", "information_schema", "performance_schema", "infodba_schema"];

/// Table selection. The form lists win over `tables_list`, which wins over `regex`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    pub databases: Vec<String>,
    pub tables: Vec<String>,
    pub exclude_databases: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub tables_list: Vec<String>,
    pub regex: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FilterMode<'a> {
    Form,
    TablesList(&'a [String]),
    Regex(&'a str),
    Unfiltered,
}

impl TableFilter {
    pub fn is_form(&self) -> bool {
        !(self.databases.is_empty()
            && self.tables.is_empty()
            && self.exclude_databases.is_empty()
            && self.exclude_tables.is_empty())
    }

    pub fn mode(&self) -> FilterMode<'_> {
        if self.is_form() {
            FilterMode::Form
        } else if !self.tables_list.is_empty() {
            FilterMode::TablesList(&self.tables_list)
        } else if !self.regex.is_empty() {
            FilterMode::Regex(&self.regex)
        } else {
            FilterMode::Unfiltered
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.regex.is_empty() && !self.tables_list.is_empty() {
            return Err(BackupError::config("filter regex and tables_list are mutually exclusive"));
        }
        if self.is_form() && (!self.regex.is_empty() || !self.tables_list.is_empty()) {
            warn!("form filter is set, regex and tables_list are ignored");
        }
        for name in self
            .databases
            .iter()
            .chain(&self.tables)
            .chain(&self.exclude_databases)
            .chain(&self.exclude_tables)
        {
            if name.is_empty() || name.contains(|c: char| c == '.' || c == '`' || c.is_whitespace()) {
                return Err(BackupError::config(format!("invalid filter name '{}'", name)));
            }
        }
        for item in &self.tables_list {
            if item.split('.').count() != 2 {
                return Err(BackupError::config(format!("tables_list entry '{}' is not db.table", item)));
            }
        }
        Ok(())
    }

    /// The form filter as one mydumper/myloader compatible (PCRE) regex.
    pub fn compile_form(&self) -> String {
        let mut regex = format!("^(?!(?:({})\\.))", DUMP_EXCLUDE_DBS.join("|"));
        if !self.exclude_databases.is_empty() || !self.exclude_tables.is_empty() {
            regex.push_str(&format!(
                "(?!(?:({})\\.({})$))",
                alternation(&self.exclude_databases),
                alternation(&self.exclude_tables)
            ));
        }
        regex.push_str(&format!(
            "(?=(?:({})\\.({})$))",
            alternation(&self.databases),
            alternation(&self.tables)
        ));
        regex
    }

    /// Arguments understood by both mydumper and myloader.
    pub fn tool_args(&self) -> Vec<String> {
        match self.mode() {
            FilterMode::Form => vec!["--regex".to_string(), self.compile_form()],
            FilterMode::TablesList(list) => vec!["--tables-list".to_string(), list.join(",")],
            FilterMode::Regex(regex) => vec!["--regex".to_string(), regex.to_string()],
            FilterMode::Unfiltered => vec![
                "--regex".to_string(),
                format!("^(?!(?:({})\\.))", DUMP_EXCLUDE_DBS.join("|")),
            ],
        }
    }

    /// mysqldump only takes literal database names and `--ignore-table` pairs.
    pub fn mysqldump_targets(&self) -> Result<(Vec<String>, Vec<String>)> {
        match self.mode() {
            FilterMode::Unfiltered => Ok((Vec::new(), Vec::new())),
            FilterMode::Form => {
                let has_wildcard = self
                    .databases
                    .iter()
                    .chain(&self.exclude_databases)
                    .chain(&self.tables)
                    .chain(&self.exclude_tables)
                    .any(|n| n.contains('*'));
                if has_wildcard || !self.tables.is_empty() || !self.exclude_databases.is_empty() {
                    return Err(BackupError::config(
                        "mysqldump accepts only literal databases and exclude_tables",
                    ));
                }
                let mut ignore = Vec::new();
                for db in &self.databases {
                    for table in &self.exclude_tables {
                        ignore.push(format!("{}.{}", db, table));
                    }
                }
                Ok((self.databases.clone(), ignore))
            }
            _ => Err(BackupError::config("mysqldump does not support regex or tables_list filters")),
        }
    }
}

fn alternation(items: &[String]) -> String {
    if items.is_empty() {
        return ".*".to_string();
    }
    items
        .iter()
        .map(|item| {
            item.split('*')
                .map(regex::escape)
                .collect::<Vec<String>>()
                .join(".*")
        })
        .collect::<Vec<String>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mode_priority() {
        let mut filter = TableFilter {
            tables_list: names(&["db1.t1"]),
            ..Default::default()
        };
        assert_eq!(filter.mode(), FilterMode::TablesList(&names(&["db1.t1"])));
        filter.databases = names(&["db1"]);
        assert_eq!(filter.mode(), FilterMode::Form);
        assert_eq!(TableFilter::default().mode(), FilterMode::Unfiltered);
    }

    #[test]
    fn test_regex_and_tables_list_rejected() {
        let filter = TableFilter {
            tables_list: names(&["db1.t1"]),
            regex: "^db1\\.".to_string(),
            ..Default::default()
        };
        assert!(filter.validate().is_err());

        let bad = TableFilter {
            tables_list: names(&["t1"]),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_compile_form() {
        let filter = TableFilter {
            databases: names(&["db1", "app_*"]),
            exclude_tables: names(&["tmp_*"]),
            ..Default::default()
        };
        assert_eq!(
            filter.compile_form(),
            "^(?!(?:(mysql|sys|information_schema|performance_schema|infodba_schema)\\.))\
             (?!(?:(.*)\\.(tmp_.*)$))(?=(?:(db1|app_.*)\\.(.*)$))"
        );
    }

    #[test]
    fn test_compile_form_escapes_names() {
        let filter = TableFilter {
            databases: names(&["db$1"]),
            ..Default::default()
        };
        assert!(filter.compile_form().ends_with("(?=(?:(db\\$1)\\.(.*)$))"));
    }

    #[test]
    fn test_tool_args() {
        let filter = TableFilter {
            tables_list: names(&["db1.t1", "db2.t2"]),
            ..Default::default()
        };
        assert_eq!(filter.tool_args(), names(&["--tables-list", "db1.t1,db2.t2"]));
        let args = TableFilter::default().tool_args();
        assert_eq!(args[0], "--regex");
        assert!(args[1].starts_with("^(?!(?:(mysql|"));
    }

    #[test]
    fn test_mysqldump_targets() {
        let filter = TableFilter {
            databases: names(&["db1", "db2"]),
            exclude_tables: names(&["log"]),
            ..Default::default()
        };
        let (dbs, ignore) = filter.mysqldump_targets().unwrap();
        assert_eq!(dbs, names(&["db1", "db2"]));
        assert_eq!(ignore, names(&["db1.log", "db2.log"]));

        let wildcard = TableFilter {
            databases: names(&["db*"]),
            ..Default::default()
        };
        assert!(wildcard.mysqldump_targets().is_err());
    }
}
