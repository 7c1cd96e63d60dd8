//! Schema-tolerant field extraction + per-source mapping tables.
//!
//! Each portal publishes a slightly different JSON shape for the same data. The
//! mapping from raw item to [`CanonicalOpportunity`] is therefore driven by ranked
//! alias tables declared as data: adding a source means adding a [`SourceSpec`],
//! not new control flow.

use chrono::{DateTime, NaiveDate, Utc};
use radar_core::{CanonicalOpportunity, OpportunityStatus, Portal, TITLE_SENTINEL};
use serde::Deserialize;
use serde_json::Value;

pub const CRATE_NAME: &str = "radar-adapters";

/// Walks a dotted path (`orgao.nome`, `_links.self.href`) into a JSON value.
/// Any missing intermediate level yields `None`, never an error.
fn lookup_path<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = item;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Absence means null or empty string. `0` and `false` are present values.
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Returns the first candidate path that resolves to a present value.
pub fn pick<'a>(item: &'a Value, candidates: &[&str]) -> Option<&'a Value> {
    candidates
        .iter()
        .filter_map(|path| lookup_path(item, path))
        .find(|value| is_present(value))
}

/// Stringifies scalar values; numeric source ids become their decimal rendering.
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn pick_string(item: &Value, candidates: &[&str]) -> Option<String> {
    pick(item, candidates).and_then(value_to_string)
}

/// Truncates an ISO-8601-like timestamp to calendar-date precision.
pub fn truncate_to_date(raw: &str) -> Option<NaiveDate> {
    let prefix = raw.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

pub fn pick_date(item: &Value, candidates: &[&str]) -> Option<NaiveDate> {
    pick_string(item, candidates).and_then(|raw| truncate_to_date(&raw))
}

/// Query-parameter vocabulary a source paginates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStyle {
    /// `?offset=0&limit=50` catalogs.
    OffsetLimit {
        offset_param: &'static str,
        limit_param: &'static str,
    },
    /// `?pagina=0&tamanho=50` consultation APIs, optionally year-filtered.
    PageNumber {
        page_param: &'static str,
        size_param: &'static str,
        year_param: Option<&'static str>,
    },
}

/// Fallback agency rendered from a bare administrative unit code.
#[derive(Debug, Clone, Copy)]
pub struct AgencyCode {
    pub field: &'static str,
    pub prefix: &'static str,
}

/// Ranked candidate paths per canonical field.
#[derive(Debug, Clone, Copy)]
pub struct FieldAliases {
    pub title: &'static [&'static str],
    pub agency: &'static [&'static str],
    pub agency_code: Option<AgencyCode>,
    pub state: &'static [&'static str],
    pub city: &'static [&'static str],
    pub modality: &'static [&'static str],
    pub notice: &'static [&'static str],
    pub link: &'static [&'static str],
    pub deadline: &'static [&'static str],
}

/// Everything source-shaped: alias tables, envelope keys, pagination vocabulary.
#[derive(Debug, Clone, Copy)]
pub struct SourceSpec {
    pub source_id: &'static str,
    pub portal: Portal,
    pub page: PageStyle,
    /// Container paths tried in priority order when unwrapping a page envelope.
    pub envelope_keys: &'static [&'static str],
    /// Boolean envelope field reporting "this was the last page", preferred over
    /// the full-page heuristic when present.
    pub last_page_flag: Option<&'static str>,
    pub aliases: FieldAliases,
}

/// Registry identifier for a built-in source shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    ComprasLicitacoes,
    ComprasPregoes,
    PncpCompras,
}

impl SourceKind {
    pub fn spec(&self) -> &'static SourceSpec {
        match self {
            SourceKind::ComprasLicitacoes => &COMPRAS_LICITACOES,
            SourceKind::ComprasPregoes => &COMPRAS_PREGOES,
            SourceKind::PncpCompras => &PNCP_COMPRAS,
        }
    }
}

const COMPRAS_ALIASES: FieldAliases = FieldAliases {
    title: &["objeto", "descricao", "informacoes_gerais"],
    agency: &["uasg_nome"],
    agency_code: Some(AgencyCode {
        field: "uasg",
        prefix: "UASG",
    }),
    state: &["uf", "estado"],
    city: &["municipio"],
    modality: &["modalidade", "nome_modalidade"],
    notice: &["numero", "numero_aviso", "codigo", "identificador", "id_compra"],
    link: &["_links.self.href", "_links.self"],
    deadline: &[
        "data_abertura_proposta",
        "data_entrega_proposta",
        "data_abertura",
        "data_sessao",
    ],
};

pub static COMPRAS_LICITACOES: SourceSpec = SourceSpec {
    source_id: "compras-licitacoes",
    portal: Portal::ComprasGov,
    page: PageStyle::OffsetLimit {
        offset_param: "offset",
        limit_param: "limit",
    },
    envelope_keys: &["licitacoes", "items", "resultado", "_embedded.licitacoes"],
    last_page_flag: None,
    aliases: COMPRAS_ALIASES,
};

pub static COMPRAS_PREGOES: SourceSpec = SourceSpec {
    source_id: "compras-pregoes",
    portal: Portal::ComprasGov,
    page: PageStyle::OffsetLimit {
        offset_param: "offset",
        limit_param: "limit",
    },
    envelope_keys: &["pregoes", "items", "resultado", "_embedded.pregoes"],
    last_page_flag: None,
    aliases: COMPRAS_ALIASES,
};

pub static PNCP_COMPRAS: SourceSpec = SourceSpec {
    source_id: "pncp-compras",
    portal: Portal::Pncp,
    page: PageStyle::PageNumber {
        page_param: "pagina",
        size_param: "tamanho",
        year_param: Some("ano"),
    },
    envelope_keys: &["content", "items"],
    last_page_flag: Some("last"),
    aliases: FieldAliases {
        title: &["objetoCompra", "objeto", "descricao"],
        agency: &["orgaoNome", "orgao.nome", "unidadeGestoraNome"],
        agency_code: None,
        state: &["uf", "orgao.uf", "unidadeGestoraUf"],
        city: &["municipioNome"],
        modality: &["modalidade", "modalidadeNome"],
        notice: &["numeroCompra", "numeroEdital", "identificador"],
        link: &["urlPncp", "urlPortal"],
        deadline: &["dataAberturaProposta", "dataLimite", "dataSessaoPublica"],
    },
};

/// Unwraps a page envelope into its item list.
///
/// Tries the raw value itself, then each configured container path in order, and
/// degrades to an empty sequence when nothing matches. Never errors on shape.
pub fn extract_items(envelope: &Value, keys: &[&str]) -> Vec<Value> {
    if let Value::Array(items) = envelope {
        return items.clone();
    }
    for key in keys {
        if let Some(Value::Array(items)) = lookup_path(envelope, key) {
            return items.clone();
        }
    }
    Vec::new()
}

/// Maps one raw page item to the canonical shape. Pure, no I/O; the ingestion
/// clock is passed in.
pub fn map_item(raw: &Value, spec: &SourceSpec, now: DateTime<Utc>) -> CanonicalOpportunity {
    let aliases = &spec.aliases;

    let title = pick_string(raw, aliases.title).unwrap_or_else(|| TITLE_SENTINEL.to_string());
    let agency = pick_string(raw, aliases.agency).or_else(|| {
        aliases.agency_code.as_ref().and_then(|code| {
            pick_string(raw, &[code.field]).map(|unit| format!("{} {unit}", code.prefix))
        })
    });
    let notice_number = pick_string(raw, aliases.notice).filter(|n| !n.is_empty());

    CanonicalOpportunity {
        title,
        portal: spec.portal,
        agency,
        state: pick_string(raw, aliases.state),
        city: pick_string(raw, aliases.city),
        modality: pick_string(raw, aliases.modality),
        notice_number,
        link: pick_string(raw, aliases.link),
        deadline_date: pick_date(raw, aliases.deadline),
        status: OpportunityStatus::Monitoring,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 20, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn pick_returns_first_present_candidate_in_order() {
        let item = json!({ "a": null, "b": "", "c": "valor", "d": "outro" });
        let picked = pick(&item, &["a", "b", "c", "d"]).unwrap();
        assert_eq!(picked, &json!("valor"));
    }

    #[test]
    fn pick_treats_zero_and_false_as_present() {
        let item = json!({ "numero": 0, "ativo": false });
        assert_eq!(pick_string(&item, &["numero"]).as_deref(), Some("0"));
        assert_eq!(pick_string(&item, &["ativo"]).as_deref(), Some("false"));
    }

    #[test]
    fn pick_over_all_absent_candidates_is_none() {
        let item = json!({ "a": null, "b": "" });
        assert!(pick(&item, &["a", "b", "missing"]).is_none());
    }

    #[test]
    fn nested_paths_tolerate_missing_levels() {
        let item = json!({ "_links": { "self": { "href": "https://x/1" } } });
        assert_eq!(
            pick_string(&item, &["_links.next.href", "_links.self.href"]).as_deref(),
            Some("https://x/1")
        );
        assert!(pick_string(&json!({}), &["_links.self.href"]).is_none());
    }

    #[test]
    fn timestamps_truncate_to_calendar_dates() {
        assert_eq!(
            truncate_to_date("2026-09-15T10:00:00-03:00"),
            NaiveDate::from_ymd_opt(2026, 9, 15)
        );
        assert_eq!(truncate_to_date("2026-09-15"), NaiveDate::from_ymd_opt(2026, 9, 15));
        assert!(truncate_to_date("breve").is_none());
    }

    #[test]
    fn compras_item_maps_with_numeric_notice_and_nested_link() {
        let raw = json!({
            "objeto": "Aquisição de livros didáticos",
            "numero": 152026,
            "uasg_nome": "Ministério da Educação",
            "uf": "DF",
            "modalidade": "Pregão Eletrônico",
            "data_abertura_proposta": "2026-09-15T10:00:00",
            "_links": { "self": { "href": "https://compras.dados.gov.br/licitacoes/id/1" } }
        });
        let opp = map_item(&raw, &COMPRAS_LICITACOES, now());
        assert_eq!(opp.title, "Aquisição de livros didáticos");
        assert_eq!(opp.portal, Portal::ComprasGov);
        assert_eq!(opp.notice_number.as_deref(), Some("152026"));
        assert_eq!(opp.agency.as_deref(), Some("Ministério da Educação"));
        assert_eq!(opp.state.as_deref(), Some("DF"));
        assert_eq!(opp.deadline_date, NaiveDate::from_ymd_opt(2026, 9, 15));
        assert_eq!(
            opp.link.as_deref(),
            Some("https://compras.dados.gov.br/licitacoes/id/1")
        );
        assert_eq!(opp.updated_at, now());
    }

    #[test]
    fn compras_agency_falls_back_to_uasg_code() {
        let raw = json!({ "objeto": "Serviço de limpeza", "uasg": 70011 });
        let opp = map_item(&raw, &COMPRAS_PREGOES, now());
        assert_eq!(opp.agency.as_deref(), Some("UASG 70011"));
    }

    #[test]
    fn pncp_item_prefers_objeto_compra_and_nested_orgao() {
        let raw = json!({
            "objetoCompra": "Contratação de merenda escolar",
            "numeroCompra": "90/2026",
            "orgao": { "nome": "Prefeitura de Campinas", "uf": "SP" },
            "dataAberturaProposta": "2026-10-01T08:00:00Z"
        });
        let opp = map_item(&raw, &PNCP_COMPRAS, now());
        assert_eq!(opp.title, "Contratação de merenda escolar");
        assert_eq!(opp.portal, Portal::Pncp);
        assert_eq!(opp.agency.as_deref(), Some("Prefeitura de Campinas"));
        assert_eq!(opp.state.as_deref(), Some("SP"));
        assert_eq!(opp.notice_number.as_deref(), Some("90/2026"));
        assert_eq!(opp.deadline_date, NaiveDate::from_ymd_opt(2026, 10, 1));
    }

    #[test]
    fn bare_item_maps_to_sentinel_title_and_stays_unidentifiable() {
        let opp = map_item(&json!({}), &PNCP_COMPRAS, now());
        assert_eq!(opp.title, TITLE_SENTINEL);
        assert!(opp.notice_number.is_none());
        assert!(!opp.is_identifiable());
        assert_eq!(opp.status, OpportunityStatus::Monitoring);
    }

    #[test]
    fn mapped_title_is_never_empty() {
        let raw = json!({ "objeto": "", "descricao": null });
        let opp = map_item(&raw, &COMPRAS_LICITACOES, now());
        assert_eq!(opp.title, TITLE_SENTINEL);
    }

    #[test]
    fn envelope_extraction_checks_keys_in_priority_order() {
        let direct = json!([{ "objeto": "a" }]);
        assert_eq!(extract_items(&direct, COMPRAS_LICITACOES.envelope_keys).len(), 1);

        let keyed = json!({ "licitacoes": [{ "objeto": "a" }, { "objeto": "b" }] });
        assert_eq!(extract_items(&keyed, COMPRAS_LICITACOES.envelope_keys).len(), 2);

        let nested = json!({ "_embedded": { "licitacoes": [{ "objeto": "c" }] } });
        assert_eq!(extract_items(&nested, COMPRAS_LICITACOES.envelope_keys).len(), 1);
    }

    #[test]
    fn unexpected_envelope_shapes_degrade_to_empty() {
        for envelope in [
            json!({ "licitacoes": { "total": 3 } }),
            json!({ "erro": "indisponível" }),
            json!("mensagem"),
            Value::Null,
        ] {
            assert!(extract_items(&envelope, COMPRAS_LICITACOES.envelope_keys).is_empty());
        }
    }
}
