use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use legacyset::ast::{QueryDescriptor, Q};
use legacyset::config::Settings;
use legacyset::db::{self, introspect_model, Connections, PostgresDriver, Value};
use legacyset::queryset::{IndexKey, QuerySet, Shaped, ValuesList};
use std::path::PathBuf;
use std::sync::Arc;
use unicode_width::UnicodeWidthStr;

const MAX_CELL_WIDTH: usize = 40;

/// Run lazy, model-shaped queries against a legacy PostgreSQL table
#[derive(Parser)]
#[command(version, about)]
#[command(group(ArgGroup::new("action").args(["count", "exists", "first", "last", "sql"])))]
#[command(group(ArgGroup::new("access").args(["slice", "index"])))]
struct Cli {
    /// Database alias from the settings file
    #[arg(long, default_value = "default")]
    db: String,

    /// Table to query
    #[arg(long)]
    table: String,

    #[arg(long, default_value = "public")]
    schema: String,

    /// Predicate as field__lookup=value; lists for `in`/`range` are comma-separated
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// Negated predicate, same syntax as --filter
    #[arg(long = "exclude")]
    excludes: Vec<String>,

    /// Ordering field; prefix with `-` for descending, `?` for random
    #[arg(long = "order-by", allow_hyphen_values = true)]
    order_by: Vec<String>,

    #[arg(long)]
    distinct: bool,

    /// Return mappings of these fields (all fields when empty)
    #[arg(long, value_delimiter = ',', num_args = 0.., conflicts_with = "values_list")]
    values: Option<Vec<String>>,

    /// Return tuples of these fields (all fields when empty)
    #[arg(long = "values-list", value_delimiter = ',', num_args = 0..)]
    values_list: Option<Vec<String>>,

    /// With exactly one --values-list field, print a flat column
    #[arg(long, requires = "values_list")]
    flat: bool,

    /// Row range as start:stop
    #[arg(long)]
    slice: Option<String>,

    /// Single row by position
    #[arg(long)]
    index: Option<String>,

    #[arg(long)]
    count: bool,

    #[arg(long)]
    exists: bool,

    #[arg(long)]
    first: bool,

    #[arg(long)]
    last: bool,

    /// Print the compiled SQL and parameters without running it
    #[arg(long)]
    sql: bool,

    /// Print rows as JSON
    #[arg(long)]
    json: bool,

    /// Log executed statements and enable debug mode
    #[arg(short, long)]
    verbose: bool,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .with_writer(std::io::stderr)
        .init();

    let connections = connect(&cli)?;
    let model = introspect_model(&connections, &cli.db, &cli.schema, &cli.table)
        .with_context(|| format!("failed to introspect {}.{}", cli.schema, cli.table))?;
    if model.fields.is_empty() {
        bail!("table {}.{} not found on {:?}", cli.schema, cli.table, cli.db);
    }

    let mut descriptor = QueryDescriptor::new(Arc::new(model));
    for filter in &cli.filters {
        descriptor = descriptor.filter(parse_predicate(filter)?);
    }
    for exclude in &cli.excludes {
        descriptor = descriptor.exclude(parse_predicate(exclude)?);
    }
    if !cli.order_by.is_empty() {
        descriptor = descriptor.order_by(cli.order_by.iter().cloned());
    }
    if cli.distinct {
        descriptor = descriptor.distinct();
    }
    if let Some(fields) = &cli.values {
        descriptor = descriptor.values(fields.iter().cloned());
    }

    let mut qs = QuerySet::with_global(descriptor)?;
    if let Some(fields) = &cli.values_list {
        // --sql/--count/--exists stay lazy even when --flat is given
        let eager = cli.flat && !(cli.sql || cli.count || cli.exists);
        match qs.values_list(fields.iter().cloned(), eager)? {
            ValuesList::Flat(values) => {
                print_flat(&values, cli.json)?;
                return Ok(());
            }
            ValuesList::Lazy(tuples) => qs = tuples,
        }
    }

    if cli.sql {
        println!("{}", qs.sql());
        if !qs.params().is_empty() {
            let params: Vec<String> = qs.params().iter().map(Value::display).collect();
            println!("-- params: [{}]", params.join(", "));
        }
        return Ok(());
    }
    if cli.count {
        println!("{}", qs.count()?);
        return Ok(());
    }
    if cli.exists {
        println!("{}", qs.exists()?);
        return Ok(());
    }

    let rows: Vec<Shaped> = if cli.first {
        qs.first()?.into_iter().collect()
    } else if cli.last {
        qs.last()?.into_iter().collect()
    } else if let Some(key) = cli.slice.as_deref().or(cli.index.as_deref()) {
        qs.get_item(IndexKey::parse(key)?)?.into_vec()
    } else {
        qs.to_vec()?
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print_table(&rows);
    }
    Ok(())
}

/// Load settings, resolve the selected alias' password and install the
/// connection table.
fn connect(cli: &Cli) -> Result<Arc<Connections>> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("failed to load settings")?;

    if !settings.databases.contains_key(&cli.db) {
        let path = cli.config.clone().unwrap_or_else(Settings::config_path);
        bail!(
            "no database alias {:?} in {} (configured: {})",
            cli.db,
            path.display(),
            settings.databases.keys().cloned().collect::<Vec<_>>().join(", ")
        );
    }
    settings.databases.retain(|alias, _| *alias == cli.db);
    settings.debug |= cli.verbose;

    // Resolve password: alias variable, PGPASSWORD, then interactive prompt
    settings.resolve_passwords();
    for alias in settings.missing_passwords() {
        if let Some(config) = settings.databases.get_mut(&alias) {
            let prompt = format!("Password for {}: ", config.display_string());
            config.password = rpassword::read_password_from_tty(Some(&prompt))?;
        }
    }

    let connections = Connections::connect_all(Arc::new(PostgresDriver), &settings)
        .with_context(|| format!("failed to connect to {:?}", cli.db))?;
    Ok(db::install(connections)?)
}

/// `age__gte=18` → `Q::new("age__gte", 18)`.
fn parse_predicate(input: &str) -> Result<Q> {
    let Some((path, raw)) = input.split_once('=') else {
        bail!("expected field__lookup=value, got {:?}", input);
    };
    let path = path.trim();
    let value = if path.ends_with("__in") || path.ends_with("__range") {
        Value::Array(
            raw.split(',')
                .filter(|item| !item.trim().is_empty())
                .map(|item| Value::parse_literal(item.trim()))
                .collect(),
        )
    } else {
        Value::parse_literal(raw)
    };
    Ok(Q::new(path, value))
}

fn print_flat(values: &[Value], json: bool) -> Result<()> {
    if json {
        let values: Vec<serde_json::Value> = values.iter().map(Value::to_json).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
    } else {
        for value in values {
            println!("{}", value.display());
        }
    }
    Ok(())
}

fn truncate_cell(text: String) -> String {
    if text.width() <= MAX_CELL_WIDTH {
        return text;
    }
    let mut out = String::new();
    for ch in text.chars() {
        if out.width() + 2 > MAX_CELL_WIDTH {
            break;
        }
        out.push(ch);
    }
    out.push('…');
    out
}

fn pad(text: &str, width: usize) -> String {
    let fill = width.saturating_sub(text.width());
    format!("{}{}", text, " ".repeat(fill))
}

fn print_table(rows: &[Shaped]) {
    let Some(first) = rows.first() else {
        println!("(0 rows)");
        return;
    };

    let headers: Vec<String> = first
        .cells()
        .iter()
        .enumerate()
        .map(|(i, (name, _))| name.map(str::to_string).unwrap_or_else(|| i.to_string()))
        .collect();
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            row.cells()
                .into_iter()
                .map(|(_, value)| truncate_cell(value.display()))
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.width()).collect();
    for line in &body {
        for (i, cell) in line.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.width());
            }
        }
    }

    let render = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| pad(cell, *width))
            .collect::<Vec<_>>()
            .join(" | ")
    };
    println!("{}", render(&headers));
    println!(
        "{}",
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-")
    );
    for line in &body {
        println!("{}", render(line));
    }
    println!("({} rows)", rows.len());
}
