//! Minimal `$VARIABLE` template substitution for service units, tmpfiles
//! fragments and host-install templates.
//!
//! Supported forms are `$NAME`, `${NAME}` and `$$` for a literal dollar.
//! Substituting with an unresolved variable is a configuration error.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};

/// The substitution map; ordered so rendered output and serialized
/// `values` are stable.
pub(crate) type Values = BTreeMap<String, String>;

fn ident_len(s: &str) -> usize {
    s.bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count()
}

/// Render `template`, replacing every placeholder from `values`.
pub(crate) fn substitute(template: &str, values: &Values) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        if let Some(r) = rest.strip_prefix('$') {
            out.push('$');
            rest = r;
            continue;
        }
        let (name, remainder) = if let Some(r) = rest.strip_prefix('{') {
            let Some(end) = r.find('}') else {
                bail!("Unterminated ${{...}} placeholder in template");
            };
            (&r[..end], &r[end + 1..])
        } else {
            let len = ident_len(rest);
            if len == 0 {
                bail!("Invalid placeholder `$` in template");
            }
            (&rest[..len], &rest[len..])
        };
        match values.get(name) {
            Some(v) => out.push_str(v),
            None => bail!("The template still contains an unreplaced value for: '{name}'"),
        }
        rest = remainder;
    }
    out.push_str(rest);
    Ok(out)
}

/// Collect the variable names referenced by `template`.
pub(crate) fn variables(template: &str) -> BTreeSet<String> {
    let mut vars = BTreeSet::new();
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        if let Some(r) = rest.strip_prefix('$') {
            rest = r;
            continue;
        }
        if let Some(r) = rest.strip_prefix('{') {
            if let Some(end) = r.find('}') {
                vars.insert(r[..end].to_string());
                rest = &r[end + 1..];
                continue;
            }
            break;
        }
        let len = ident_len(rest);
        if len > 0 {
            vars.insert(rest[..len].to_string());
        }
        rest = &rest[len..];
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn values(pairs: &[(&str, &str)]) -> Values {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitute() {
        let v = values(&[("NAME", "app"), ("DESTDIR", "/var/lib/app.0")]);
        assert_eq!(
            substitute("Description=$NAME in ${DESTDIR}, costs $$1", &v).unwrap(),
            "Description=app in /var/lib/app.0, costs $1"
        );
    }

    #[test]
    fn test_substitute_unresolved() {
        let err = substitute("ExecStart=$EXEC_START", &Values::new()).unwrap_err();
        assert!(err.to_string().contains("EXEC_START"), "{err}");
        assert!(substitute("bad $", &Values::new()).is_err());
        assert!(substitute("bad ${OPEN", &Values::new()).is_err());
    }

    #[test]
    fn test_variables() {
        let vars = variables("$A ${B_2} $$C $A");
        assert_eq!(
            vars.into_iter().collect::<Vec<_>>(),
            vec!["A".to_string(), "B_2".to_string()]
        );
    }
}
