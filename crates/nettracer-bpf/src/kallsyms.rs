//! Kernel symbol address resolution from `/proc/kallsyms`

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_KALLSYMS_PATH: &str = "/proc/kallsyms";

/// Resolve the addresses of `symbols` from a kallsyms file.
///
/// Every requested symbol must be present with a non-zero address. A zero address means the
/// caller lacks the privileges to read kernel addresses, which would silently break the
/// probe programs that compare against them.
pub fn resolve_addresses(path: &Path, symbols: &[&str]) -> Result<HashMap<String, u64>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    resolve_from_str(&content, symbols)
}

fn resolve_from_str(content: &str, symbols: &[&str]) -> Result<HashMap<String, u64>> {
    let mut found = HashMap::with_capacity(symbols.len());

    for line in content.lines() {
        // <address> <type> <name> [module]
        let mut fields = line.split_whitespace();
        let (Some(addr), Some(_kind), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        if !symbols.contains(&name) || found.contains_key(name) {
            continue;
        }

        let addr = u64::from_str_radix(addr, 16)
            .with_context(|| format!("Invalid address {addr:?} for symbol {name}"))?;
        found.insert(name.to_owned(), addr);

        if found.len() == symbols.len() {
            break;
        }
    }

    for symbol in symbols {
        match found.get(*symbol) {
            None => bail!("Symbol {symbol} not found in kallsyms"),
            Some(0) => bail!("Symbol {symbol} has a zero address, is kptr_restrict enabled?"),
            Some(_) => {}
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KALLSYMS: &str = "\
ffffffff81000000 T startup_64
ffffffff82a1b2c0 d socket_file_ops
ffffffffc0a01000 t inet_bind_helper\t[some_module]
";

    #[test_log::test]
    fn test_resolve_known_symbol() {
        let addresses = resolve_from_str(KALLSYMS, &["socket_file_ops"]).unwrap();
        assert_eq!(addresses["socket_file_ops"], 0xffffffff82a1b2c0);
    }

    #[test_log::test]
    fn test_module_symbols_are_resolved() {
        let addresses = resolve_from_str(KALLSYMS, &["inet_bind_helper", "startup_64"]).unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses["inet_bind_helper"], 0xffffffffc0a01000);
    }

    #[test_log::test]
    fn test_missing_symbol_fails() {
        let err = resolve_from_str(KALLSYMS, &["tcp_v4_connect"]).unwrap_err();
        assert!(err.to_string().contains("tcp_v4_connect"));
    }

    #[test_log::test]
    fn test_restricted_addresses_fail() {
        let restricted = "0000000000000000 d socket_file_ops\n";
        let err = resolve_from_str(restricted, &["socket_file_ops"]).unwrap_err();
        assert!(err.to_string().contains("kptr_restrict"));
    }
}
