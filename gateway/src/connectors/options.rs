//! Connection URL resolution.
//!
//! URL-configured backends (MySQL, PostgreSQL, MongoDB) resolve a single
//! connection URL from the caller's `url` or fields, the dialect's
//! environment defaults, and finally the `options` bag. Options always win.

use serde_json::Value;
use url::Url;

use common::config::DialectDefaults;
use common::errors::{AppError, AppResult};
use common::models::connection::{port_arg, scalar_to_string};
use common::models::{ConnectArgs, DbType};

/// Option keys that address URL components instead of query parameters.
const COMPONENT_KEYS: [&str; 7] = [
    "host", "server", "port", "user", "username", "password", "database",
];

fn scheme(db_type: DbType) -> AppResult<&'static str> {
    match db_type {
        DbType::MySQL => Ok("mysql"),
        DbType::Postgres => Ok("postgres"),
        DbType::MongoDB => Ok("mongodb"),
        other => Err(AppError::Internal(format!(
            "{} is not configured through a URL",
            other.display_name()
        ))),
    }
}

fn invalid(db_type: DbType, what: &str) -> AppError {
    AppError::Validation(format!(
        "{}: invalid connection {what}",
        db_type.display_name()
    ))
}

/// Resolves the connection URL for `db_type`.
///
/// MongoDB URLs never carry the database in their path; the database name is
/// resolved separately by the connector.
pub fn resolve_url(
    db_type: DbType,
    args: &ConnectArgs,
    defaults: &DialectDefaults,
) -> AppResult<Url> {
    let mut url = match &args.url {
        Some(raw) => Url::parse(raw).map_err(|e| {
            AppError::Validation(format!("{}: invalid connection URL: {e}", db_type.display_name()))
        })?,
        None => build_url(db_type, args, defaults)?,
    };
    overlay_options(db_type, &mut url, args)?;
    Ok(url)
}

fn build_url(db_type: DbType, args: &ConnectArgs, defaults: &DialectDefaults) -> AppResult<Url> {
    let host = args.host.as_deref().unwrap_or(&defaults.host);
    let mut url = Url::parse(&format!("{}://localhost", scheme(db_type)?))
        .map_err(|_| invalid(db_type, "URL"))?;
    url.set_host(Some(host)).map_err(|_| invalid(db_type, "host"))?;
    url.set_port(Some(args.port.unwrap_or(defaults.port)))
        .map_err(|_| invalid(db_type, "port"))?;

    let user = args.user.clone().or_else(|| defaults.user.clone());
    let password = args.password.clone().or_else(|| defaults.password.clone());
    // MongoDB authenticates only when both halves of the credential are known.
    let with_auth = db_type != DbType::MongoDB || (user.is_some() && password.is_some());
    if with_auth {
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            url.set_username(&user).map_err(|_| invalid(db_type, "user"))?;
            if let Some(password) = password.filter(|p| !p.is_empty()) {
                url.set_password(Some(&password))
                    .map_err(|_| invalid(db_type, "password"))?;
            }
        }
    }

    if db_type != DbType::MongoDB {
        if let Some(database) = args.database.as_ref().or(defaults.database.as_ref()) {
            url.set_path(&format!("/{database}"));
        }
    }
    Ok(url)
}

fn overlay_options(db_type: DbType, url: &mut Url, args: &ConnectArgs) -> AppResult<()> {
    // Explicit fields override the components of a caller-provided URL.
    if args.url.is_some() {
        if let Some(host) = &args.host {
            url.set_host(Some(host)).map_err(|_| invalid(db_type, "host"))?;
        }
        if let Some(port) = args.port {
            url.set_port(Some(port)).map_err(|_| invalid(db_type, "port"))?;
        }
        if let Some(user) = &args.user {
            url.set_username(user).map_err(|_| invalid(db_type, "user"))?;
        }
        if let Some(password) = &args.password {
            url.set_password(Some(password))
                .map_err(|_| invalid(db_type, "password"))?;
        }
        if let Some(database) = args.database.as_ref().filter(|_| db_type != DbType::MongoDB) {
            url.set_path(&format!("/{database}"));
        }
    }

    for (key, value) in &args.options {
        match key.as_str() {
            "host" | "server" => {
                let host = option_text(db_type, key, value)?;
                url.set_host(Some(&host)).map_err(|_| invalid(db_type, "host"))?;
            }
            "port" => {
                let port = port_arg(Some(value))?;
                url.set_port(port).map_err(|_| invalid(db_type, "port"))?;
            }
            "user" | "username" => {
                let user = option_text(db_type, key, value)?;
                url.set_username(&user).map_err(|_| invalid(db_type, "user"))?;
            }
            "password" => {
                let password = option_text(db_type, key, value)?;
                url.set_password(Some(&password))
                    .map_err(|_| invalid(db_type, "password"))?;
            }
            "database" if db_type != DbType::MongoDB => {
                let database = option_text(db_type, key, value)?;
                url.set_path(&format!("/{database}"));
            }
            _ => {}
        }
    }

    let extra: Vec<(String, String)> = args
        .options
        .iter()
        .filter(|(key, _)| !COMPONENT_KEYS.contains(&key.as_str()))
        .map(|(key, value)| {
            let text = match value {
                Value::Object(_) | Value::Array(_) => value.to_string(),
                other => scalar_to_string(other).unwrap_or_default(),
            };
            (key.clone(), text)
        })
        .collect();
    if !extra.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &extra {
            pairs.append_pair(key, value);
        }
    }
    Ok(())
}

fn option_text(db_type: DbType, key: &str, value: &Value) -> AppResult<String> {
    scalar_to_string(value).ok_or_else(|| {
        AppError::Validation(format!(
            "{}: option '{key}' must be a scalar",
            db_type.display_name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> ConnectArgs {
        ConnectArgs::from_args(value.as_object().unwrap()).unwrap()
    }

    fn defaults(db_type: DbType) -> DialectDefaults {
        DialectDefaults::from_lookup(db_type, |_| None)
    }

    #[test]
    fn test_builds_url_from_defaults() {
        let url = resolve_url(DbType::MySQL, &args(json!({})), &defaults(DbType::MySQL)).unwrap();
        assert_eq!(url.as_str(), "mysql://root@localhost:3306");
    }

    #[test]
    fn test_fields_override_defaults() {
        let url = resolve_url(
            DbType::Postgres,
            &args(json!({"host": "db", "port": 6543, "user": "app", "password": "p@ss", "database": "shop"})),
            &defaults(DbType::Postgres),
        )
        .unwrap();
        assert_eq!(url.host_str(), Some("db"));
        assert_eq!(url.port(), Some(6543));
        assert_eq!(url.username(), "app");
        assert_eq!(url.password(), Some("p%40ss"));
        assert_eq!(url.path(), "/shop");
    }

    #[test]
    fn test_options_override_everything_and_extra_keys_become_query() {
        let url = resolve_url(
            DbType::Postgres,
            &args(json!({
                "url": "postgres://u:p@h1:5432/a",
                "options": {"host": "h2", "database": "b", "sslmode": "require"}
            })),
            &defaults(DbType::Postgres),
        )
        .unwrap();
        assert_eq!(url.host_str(), Some("h2"));
        assert_eq!(url.path(), "/b");
        assert_eq!(url.query(), Some("sslmode=require"));
    }

    #[test]
    fn test_fields_override_url_components() {
        let url = resolve_url(
            DbType::MySQL,
            &args(json!({
                "url": "mysql://root:old@h1:3306/a",
                "user": "app",
                "password": "new",
                "database": "b"
            })),
            &defaults(DbType::MySQL),
        )
        .unwrap();
        assert_eq!(url.as_str(), "mysql://app:new@h1:3306/b");
    }

    #[test]
    fn test_mongo_skips_partial_credentials_and_database_path() {
        let url = resolve_url(
            DbType::MongoDB,
            &args(json!({"user": "only-user", "database": "shop"})),
            &defaults(DbType::MongoDB),
        )
        .unwrap();
        assert_eq!(url.as_str(), "mongodb://localhost:27017");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let err = resolve_url(
            DbType::MySQL,
            &args(json!({"url": "not a url"})),
            &defaults(DbType::MySQL),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
