// Dashboard - server-rendered HTML statistics page
//
// One self-contained HTML document: a filter bar, three SVG timelines
// (browsers, feed readers, scrapers) and six top-N tables. All data comes
// from the store in one snapshot; rendering itself is pure. Unique-visitor
// counts roll up per-visitor MAX(mult) before summing, so a feed fetcher
// representing N subscribers counts as N readers exactly once.
//
// Every interpolated value is HTML-escaped and every link query string is
// form-urlencoded.

use crate::sidecar::SidecarState;
use axum::{
    extract::{RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use duckdb::{params_from_iter, Connection};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

const STYLE_CSS: &str = include_str!("assets/style.css");
const SCRIPT_JS: &str = include_str!("assets/script.js");

/// Query parameters accepted as column filters; everything else is ignored.
const ALLOWED_FILTERS: &[&str] = &["host", "path", "query", "ref_domain", "agent", "type", "os"];

/// Timeline sections in display order.
const TIMELINES: &[(&str, &str)] = &[
    ("browser", "Unique visitors"),
    ("feed", "RSS Readers"),
    ("bot", "Scrapers"),
];

/// Query parameters, values in arrival order per key. A BTreeMap keeps link
/// query strings deterministic.
type Params = BTreeMap<String, Vec<String>>;

/// One top-N table row; None is the "Others" aggregate.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RowCount {
    value: Option<String>,
    count: i64,
}

struct TableSpec {
    title: &'static str,
    column: &'static str,
    type_filter: &'static str,
    /// Group per uniq with MAX(mult) first instead of counting raw rows.
    unique: bool,
    /// Turn a cell value into an external link.
    href: Option<fn(&str) -> String>,
}

const TABLES: &[TableSpec] = &[
    TableSpec {
        title: "Paths",
        column: "path",
        type_filter: "browser",
        unique: false,
        href: Some(|v| v.to_string()),
    },
    TableSpec {
        title: "Queries",
        column: "query",
        type_filter: "browser",
        unique: false,
        href: None,
    },
    TableSpec {
        title: "Referrers",
        column: "ref_domain",
        type_filter: "browser",
        unique: false,
        href: Some(|v| format!("https://{}", v)),
    },
    TableSpec {
        title: "Browsers",
        column: "agent",
        type_filter: "browser",
        unique: true,
        href: None,
    },
    TableSpec {
        title: "RSS Readers",
        column: "agent",
        type_filter: "feed",
        unique: true,
        href: None,
    },
    TableSpec {
        title: "Scrapers",
        column: "agent",
        type_filter: "bot",
        unique: true,
        href: None,
    },
];

/// Everything the renderer needs, fetched in one store snapshot.
struct DashboardData {
    min_date: NaiveDate,
    max_date: NaiveDate,
    hosts: Vec<String>,
    visits: HashMap<String, BTreeMap<NaiveDate, i64>>,
    totals: HashMap<String, i64>,
    tables: Vec<Vec<RowCount>>,
}

pub async fn favicon_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn stats_handler(State(state): State<SidecarState>, RawQuery(raw): RawQuery) -> Response {
    let params = parse_query(raw.as_deref().unwrap_or(""));

    let (from, to) = match parse_date_range(&params) {
        Some(range) => range,
        None => return redirect_to_current_year(&params).into_response(),
    };

    let filters = extract_filters(&params);
    let (where_clause, args) = build_where(&params["from"][0], &params["to"][0], &filters);

    let data = {
        let where_clause = where_clause.clone();
        state
            .store
            .with_conn(move |conn| Ok(fetch_dashboard_data(conn, &where_clause, &args)))
            .await
    };
    let data = match data {
        Ok(data) => data,
        Err(err) => {
            tracing::error!("dashboard query failed: {}", err);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let body = render(&data, &params, from, to);
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

fn parse_date_range(params: &Params) -> Option<(NaiveDate, NaiveDate)> {
    let from = NaiveDate::parse_from_str(first(params, "from")?, "%Y-%m-%d").ok()?;
    let to = NaiveDate::parse_from_str(first(params, "to")?, "%Y-%m-%d").ok()?;
    Some((from, to))
}

fn redirect_to_current_year(params: &Params) -> Redirect {
    let (from, to) = current_year_range();
    let mut target = params.clone();
    target.insert("from".into(), vec![from.format("%Y-%m-%d").to_string()]);
    target.insert("to".into(), vec![to.format("%Y-%m-%d").to_string()]);
    Redirect::to(&format!("?{}", encode_params(&target)))
}

fn current_year_range() -> (NaiveDate, NaiveDate) {
    let year = Utc::now().year();
    (
        NaiveDate::from_ymd_opt(year, 1, 1).expect("jan 1"),
        NaiveDate::from_ymd_opt(year, 12, 31).expect("dec 31"),
    )
}

// ── Query layer ──────────────────────────────────────────────────────────────

/// Run every dashboard query on one connection. A failing query logs and
/// leaves its section empty rather than failing the page.
fn fetch_dashboard_data(conn: &Connection, where_clause: &str, args: &[String]) -> DashboardData {
    let (min_date, max_date) = min_max_date(conn).unwrap_or_else(|err| {
        tracing::warn!("dashboard date bounds query failed: {}", err);
        current_year_range()
    });
    let hosts = distinct_hosts(conn).unwrap_or_else(|err| {
        tracing::warn!("dashboard hosts query failed: {}", err);
        Vec::new()
    });
    let visits = visits_by_type_date(conn, where_clause, args).unwrap_or_else(|err| {
        tracing::warn!("dashboard timeline query failed: {}", err);
        HashMap::new()
    });
    let totals = totals_by_type(conn, where_clause, args).unwrap_or_else(|err| {
        tracing::warn!("dashboard totals query failed: {}", err);
        HashMap::new()
    });
    let tables = TABLES
        .iter()
        .map(|spec| {
            top_rows(conn, spec, where_clause, args).unwrap_or_else(|err| {
                tracing::warn!("dashboard table {} query failed: {}", spec.title, err);
                Vec::new()
            })
        })
        .collect();

    DashboardData {
        min_date,
        max_date,
        hosts,
        visits,
        totals,
        tables,
    }
}

fn min_max_date(conn: &Connection) -> anyhow::Result<(NaiveDate, NaiveDate)> {
    let (min, max): (Option<String>, Option<String>) = conn.query_row(
        "SELECT CAST(min(date) AS VARCHAR), CAST(max(date) AS VARCHAR) FROM stats",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let (default_min, default_max) = current_year_range();
    let parse = |v: Option<String>, fallback: NaiveDate| {
        v.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
            .unwrap_or(fallback)
    };
    Ok((parse(min, default_min), parse(max, default_max)))
}

fn distinct_hosts(conn: &Connection) -> anyhow::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT host FROM stats WHERE host IS NOT NULL ORDER BY host")?;
    let mut rows = stmt.query([])?;
    let mut hosts = Vec::new();
    while let Some(row) = rows.next()? {
        let host: Option<String> = row.get(0)?;
        if let Some(host) = host {
            if !host.is_empty() {
                hosts.push(host);
            }
        }
    }
    Ok(hosts)
}

fn visits_by_type_date(
    conn: &Connection,
    where_clause: &str,
    args: &[String],
) -> anyhow::Result<HashMap<String, BTreeMap<NaiveDate, i64>>> {
    let sql = format!(
        "WITH subq AS (
             SELECT type, date, MAX(mult) AS mult
             FROM stats
             WHERE {where_clause}
             GROUP BY type, date, uniq
         )
         SELECT CAST(type AS VARCHAR), CAST(date AS VARCHAR), CAST(SUM(mult) AS BIGINT)
         FROM subq
         GROUP BY type, date"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(args.iter()))?;
    let mut result: HashMap<String, BTreeMap<NaiveDate, i64>> = HashMap::new();
    while let Some(row) = rows.next()? {
        let typ: Option<String> = row.get(0)?;
        let date: Option<String> = row.get(1)?;
        let count: i64 = row.get(2)?;
        let (Some(typ), Some(date)) = (typ, date) else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") else {
            continue;
        };
        result.entry(typ).or_default().insert(date, count);
    }
    Ok(result)
}

fn totals_by_type(
    conn: &Connection,
    where_clause: &str,
    args: &[String],
) -> anyhow::Result<HashMap<String, i64>> {
    let sql = format!(
        "WITH subq AS (
             SELECT type, MAX(mult) AS mult
             FROM stats
             WHERE {where_clause}
             GROUP BY type, uniq
         )
         SELECT CAST(type AS VARCHAR), CAST(SUM(mult) AS BIGINT)
         FROM subq
         GROUP BY type"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(args.iter()))?;
    let mut result = HashMap::new();
    while let Some(row) = rows.next()? {
        let typ: Option<String> = row.get(0)?;
        let count: i64 = row.get(1)?;
        if let Some(typ) = typ {
            result.insert(typ, count);
        }
    }
    Ok(result)
}

/// Top 10 values of a column plus an "Others" aggregate. Raw tables count
/// rows; unique tables roll up MAX(mult) per visitor first.
fn top_rows(
    conn: &Connection,
    spec: &TableSpec,
    where_clause: &str,
    args: &[String],
) -> anyhow::Result<Vec<RowCount>> {
    let col = spec.column;
    let scoped = format!("{} AND type = '{}'", where_clause, spec.type_filter);
    let base = if spec.unique {
        format!(
            "SELECT ANY_VALUE({col}) AS {col}, MAX(mult) AS mult
             FROM stats WHERE {scoped} GROUP BY uniq"
        )
    } else {
        format!("SELECT {col} FROM stats WHERE {scoped}")
    };
    let measure = if spec.unique {
        "CAST(SUM(mult) AS BIGINT)"
    } else {
        "COUNT(*)"
    };
    let sql = format!(
        "WITH base_query AS ({base}),
         top_values AS (
             SELECT {col} AS value, {measure} AS count
             FROM base_query
             WHERE {col} IS NOT NULL
             GROUP BY value
             ORDER BY count DESC
         ),
         top_n AS (
             SELECT * FROM top_values ORDER BY count DESC LIMIT 10
         ),
         others AS (
             SELECT NULL AS value, {measure} AS count
             FROM base_query
             WHERE {col} IS NOT NULL AND {col} NOT IN (SELECT value FROM top_n)
         )
         SELECT * FROM top_n
         UNION ALL
         SELECT * FROM others
         WHERE count > 0"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(args.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(RowCount {
            value: row.get(0)?,
            count: row.get(1)?,
        });
    }
    Ok(out)
}

// ── Rendering ────────────────────────────────────────────────────────────────

fn render(data: &DashboardData, params: &Params, from: NaiveDate, to: NaiveDate) -> String {
    let mut page = String::new();
    line(&mut page, "<!DOCTYPE html>");
    line(&mut page, "<html>");
    line(&mut page, "<head>");
    line(&mut page, "<meta charset=\"utf-8\">");
    line(
        &mut page,
        "<link rel='icon' href='favicon.ico' sizes='32x32'>",
    );
    line(
        &mut page,
        "<link rel=\"preconnect\" href=\"https://fonts.gstatic.com\" crossorigin>",
    );
    line(
        &mut page,
        "<link href=\"https://fonts.googleapis.com/css2?family=Inter:opsz,wght@14..32,100..900&display=swap\" rel=\"stylesheet\">",
    );
    let _ = writeln!(page, "<style>{}</style>", STYLE_CSS);
    let _ = writeln!(page, "<script>{}</script>", SCRIPT_JS);
    line(&mut page, "</head>");
    line(&mut page, "<body>");

    line(&mut page, "<div class=filters>");
    render_year_filters(&mut page, data, params, from, to);
    render_host_filters(&mut page, data, params);
    render_active_filters(&mut page, params);
    line(&mut page, "</div>");

    render_timelines(&mut page, data, params, from, to);
    render_tables(&mut page, data, params);

    line(&mut page, "</body>");
    line(&mut page, "</html>");
    page
}

fn render_year_filters(
    page: &mut String,
    data: &DashboardData,
    params: &Params,
    from: NaiveDate,
    to: NaiveDate,
) {
    let mut all = params.clone();
    all.insert("from".into(), vec![data.min_date.format("%Y-%m-%d").to_string()]);
    all.insert("to".into(), vec![data.max_date.format("%Y-%m-%d").to_string()]);
    let _ = writeln!(
        page,
        "<a class=filter href='?{}'>All</a>",
        escape_html(&encode_params(&all))
    );

    for year in data.min_date.year()..=data.max_date.year() {
        let mut qs = params.clone();
        qs.insert("from".into(), vec![format!("{}-01-01", year)]);
        qs.insert("to".into(), vec![format!("{}-12-31", year)]);
        let marker = if from.year() <= year && to.year() >= year {
            " in"
        } else {
            ""
        };
        let _ = writeln!(
            page,
            "<a href='?{}' class='filter{}'>{}</a>",
            escape_html(&encode_params(&qs)),
            marker,
            year
        );
    }
}

fn render_host_filters(page: &mut String, data: &DashboardData, params: &Params) {
    for host in &data.hosts {
        let mut qs = params.clone();
        qs.insert("host".into(), vec![host.clone()]);
        let _ = writeln!(
            page,
            "<a href='?{}' class='filter'>{}</a>",
            escape_html(&encode_params(&qs)),
            escape_html(host)
        );
    }
}

fn render_active_filters(page: &mut String, params: &Params) {
    for (key, values) in params {
        if !ALLOWED_FILTERS.contains(&key.as_str()) || values.is_empty() {
            continue;
        }
        let mut qs = params.clone();
        qs.remove(key);
        let _ = writeln!(
            page,
            "<div class=filter>{}: {}<a href='?{}'>&times;</a></div>",
            escape_html(key),
            escape_html(&values[0]),
            escape_html(&encode_params(&qs))
        );
    }
}

fn render_timelines(
    page: &mut String,
    data: &DashboardData,
    params: &Params,
    from: NaiveDate,
    to: NaiveDate,
) {
    let max_val = data
        .visits
        .values()
        .flat_map(|counts| counts.values())
        .copied()
        .max()
        .unwrap_or(1)
        .max(1);
    let max_val = round_max_val(max_val);

    let dates = list_dates(from, to);
    let graph_w = dates.len() * 3;
    let bar_height = |v: i64| -> i64 { v * 100 / max_val };
    let step = horizontal_step(max_val);
    let today = Utc::now().date_naive();

    for (typ, title) in TIMELINES {
        let Some(counts) = data.visits.get(*typ) else {
            continue;
        };
        if counts.is_empty() {
            continue;
        }

        // Feed readers are steady subscriber counts, so a daily average says
        // more than a sum over the range.
        if *typ == "feed" {
            let _ = writeln!(
                page,
                "<h1>{}: ~{} / day</h1>",
                title,
                format_commas(average(counts))
            );
        } else {
            let total = data.totals.get(*typ).copied().unwrap_or(0);
            let _ = writeln!(page, "<h1>{}: {}</h1>", title, format_commas(total));
        }

        line(page, "<div class=graph_outer>");
        line(page, "<div class=graph_scroll>");
        let _ = writeln!(page, "<svg class=graph width={} height=130>", graph_w);

        let mut grid = 0;
        while grid <= max_val {
            let y = 110 - bar_height(grid);
            let _ = writeln!(page, "<line class=hrz x1=0 y1={} x2={} y2={} />", y, graph_w, y);
            grid += step;
        }

        for (idx, date) in dates.iter().enumerate() {
            let x = (idx * 3) as i64;
            let value = counts.get(date).copied().unwrap_or(0);
            if value > 0 {
                let bar = bar_height(value);
                let y = 110 - bar;
                let _ = writeln!(
                    page,
                    "<g data-v='{}' data-d='{}'>",
                    format_num(value),
                    date.format("%Y-%m-%d")
                );
                let _ = writeln!(page, "<rect class=i x={} y=0 width=3 height=110 />", x);
                let _ = writeln!(page, "<rect x={} y={} width=3 height={} />", x, y - 2, bar + 2);
                let _ = writeln!(page, "<line x1={} y1={} x2={} y2={} />", x, y - 1, x + 3, y - 1);
                line(page, "</g>");
            }
            if date.day() == 1 {
                let mut qs = params.clone();
                qs.insert("from".into(), vec![date.format("%Y-%m-%d").to_string()]);
                qs.insert(
                    "to".into(),
                    vec![month_end(*date).format("%Y-%m-%d").to_string()],
                );
                let _ = writeln!(page, "<line class=date x1={} y1=112 x2={} y2=120 />", x, x);
                let _ = writeln!(
                    page,
                    "<a href='?{}'><text x={} y=130>{}</text></a>",
                    escape_html(&encode_params(&qs)),
                    x,
                    date.format("%Y-%m")
                );
            }
            if *date == today {
                let _ = writeln!(page, "<line class=today x1={} y1=0 x2={} y2=120 />", x + 1, x + 1);
            }
        }
        line(page, "</svg>");
        line(page, "</div>");

        let _ = writeln!(page, "<svg class=graph_legend height=130>");
        let mut grid = 0;
        while grid <= max_val {
            let y = 113 - bar_height(grid);
            let _ = writeln!(
                page,
                "<text x=20 y={} text-anchor=end>{}</text>",
                y,
                format_num(grid)
            );
            grid += step;
        }
        line(page, "</svg>");

        line(page, "<div class=graph_hover style='display: none'></div>");
        line(page, "</div>");
    }
}

fn render_tables(page: &mut String, data: &DashboardData, params: &Params) {
    line(page, "<div class=tables>");
    for (spec, rows) in TABLES.iter().zip(&data.tables) {
        render_table(page, spec, rows, params);
    }
    line(page, "</div>");
}

fn render_table(page: &mut String, spec: &TableSpec, rows: &[RowCount], params: &Params) {
    if rows.is_empty() {
        return;
    }
    line(page, "<div class=table_outer>");
    let _ = writeln!(page, "<h1>{}</h1>", spec.title);
    line(page, "<table>");

    // Percentages are of this table's own total, floored at 1 so an
    // all-zero table cannot divide by zero.
    let total: i64 = rows.iter().map(|row| row.count).sum::<i64>().max(1);
    for row in rows {
        if row.count <= 0 {
            continue;
        }
        let percent = row.count as f64 * 100.0 / total as f64;
        let percent_label = if percent < 2.0 {
            format!("{:.1}%", percent)
        } else {
            format!("{:.0}%", percent)
        };

        line(page, "<tr>");
        line(page, "<td class=f>");
        if let Some(value) = &row.value {
            let mut qs = params.clone();
            qs.insert(spec.column.to_string(), vec![value.clone()]);
            let _ = writeln!(
                page,
                "<a href='?{}' title='Filter by {} = {}'>&#x1F50D;</a>",
                escape_html(&encode_params(&qs)),
                spec.column,
                escape_html(value)
            );
        }
        line(page, "</td>");
        line(page, "<th>");
        let other_class = if row.value.is_none() { " class=other" } else { "" };
        let _ = writeln!(
            page,
            "<div style='width: {}'{}></div>",
            percent_label, other_class
        );
        match (&row.value, spec.href) {
            (Some(value), Some(href)) => {
                let _ = writeln!(
                    page,
                    "<a href='{}' title='{}' target=_blank>{}</a>",
                    escape_html(&href(value)),
                    escape_html(value),
                    escape_html(value)
                );
            }
            (Some(value), None) => {
                let _ = writeln!(
                    page,
                    "<span title='{}'>{}</span>",
                    escape_html(value),
                    escape_html(value)
                );
            }
            (None, _) => {
                line(page, "<span title='Others'>Others</span>");
            }
        }
        line(page, "</th>");
        let _ = writeln!(page, "<td>{}</td>", format_num(row.count));
        let _ = writeln!(page, "<td class='pct'>{}</td>", percent_label);
        line(page, "</tr>");
    }
    line(page, "</table>");
    line(page, "</div>");
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn line(page: &mut String, text: &str) {
    page.push_str(text);
    page.push('\n');
}

fn parse_query(raw: &str) -> Params {
    let mut params: Params = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        params.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    params
}

fn encode_params(params: &Params) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, values) in params {
        for value in values {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

fn first<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.first()).map(String::as_str)
}

fn extract_filters(params: &Params) -> Vec<(String, String)> {
    let mut filters = Vec::new();
    for (key, values) in params {
        if key == "from" || key == "to" {
            continue;
        }
        if !ALLOWED_FILTERS.contains(&key.as_str()) || values.is_empty() {
            continue;
        }
        filters.push((key.clone(), values[0].clone()));
    }
    filters
}

fn build_where(from: &str, to: &str, filters: &[(String, String)]) -> (String, Vec<String>) {
    let mut clauses = vec!["date >= ?".to_string(), "date <= ?".to_string()];
    let mut args = vec![from.to_string(), to.to_string()];
    for (key, value) in filters {
        clauses.push(format!("{} = ?", key));
        args.push(value.clone());
    }
    (clauses.join(" AND "), args)
}

/// Escape text for interpolation into HTML bodies and single-quoted
/// attributes.
fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn list_dates(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut date = from;
    while date <= to {
        dates.push(date);
        date += Duration::days(1);
    }
    dates
}

fn month_end(first_day: NaiveDate) -> NaiveDate {
    (first_day + Duration::days(32))
        .with_day(1)
        .expect("day 1 exists")
        - Duration::days(1)
}

/// Round a timeline maximum up to a "nice" axis bound.
fn round_max_val(max_val: i64) -> i64 {
    match max_val {
        v if v >= 200_000 => round_to(v, 100_000),
        v if v >= 20_000 => round_to(v, 10_000),
        v if v >= 2_000 => round_to(v, 1_000),
        v if v >= 100 => round_to(v, 100),
        _ => 100,
    }
}

fn round_to(n: i64, m: i64) -> i64 {
    ((n - 1) / m + 1) * m
}

/// Gridline spacing for a given axis maximum.
fn horizontal_step(max_val: i64) -> i64 {
    match max_val {
        v if v >= 600_000 => 200_000,
        v if v >= 300_000 => 100_000,
        v if v >= 100_000 => 50_000,
        v if v >= 60_000 => 20_000,
        v if v >= 30_000 => 10_000,
        v if v >= 10_000 => 5_000,
        v if v >= 6_000 => 2_000,
        v if v >= 3_000 => 1_000,
        v if v >= 1_000 => 500,
        v if v >= 600 => 200,
        v if v >= 300 => 100,
        v if v >= 100 => 50,
        v if v >= 60 => 20,
        _ => 10,
    }
}

/// Compact count: K/M suffixes, one decimal in the small bucket, ".0"
/// dropped.
fn format_num(n: i64) -> String {
    let formatted = if n >= 10_000_000 {
        format!("{:.0}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 10_000 {
        format!("{:.0}K", n as f64 / 1_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        return n.to_string();
    };
    formatted.replace(".0M", "M").replace(".0K", "K")
}

fn format_commas(n: i64) -> String {
    let digits = n.to_string();
    if digits.len() <= 3 {
        return digits;
    }
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Rounded mean of the daily counts.
fn average(counts: &BTreeMap<NaiveDate, i64>) -> i64 {
    if counts.is_empty() {
        return 0;
    }
    let sum: i64 = counts.values().sum();
    (sum as f64 / counts.len() as f64 + 0.5) as i64
}
