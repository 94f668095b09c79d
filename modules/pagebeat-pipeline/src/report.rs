//! HTML report assembly. The renderer turns this document into the A4
//! PDF that gets delivered, so everything is inlined: styles in a
//! `<style>` block, screenshots as data URIs.

use chrono::Utc;

use pagebeat_common::{Audit, Language, MetricValue, Score};
use pagespeed_client::{CategoryReport, InsightBundle};

/// Screenshot data URIs loaded from disk by the PDF stage.
#[derive(Debug, Default)]
pub struct ScreenshotImages {
    pub desktop: Option<String>,
    pub mobile: Option<String>,
}

struct Labels {
    title: &'static str,
    performance_score: &'static str,
    core_metrics: &'static str,
    lcp: &'static str,
    fcp: &'static str,
    cls: &'static str,
    seo: &'static str,
    accessibility: &'static str,
    failed_checks: &'static str,
    all_passed: &'static str,
    screenshots: &'static str,
    desktop: &'static str,
    mobile: &'static str,
    screenshots_unavailable: &'static str,
    generated: &'static str,
}

const EN: Labels = Labels {
    title: "Performance Audit Report",
    performance_score: "Performance Score",
    core_metrics: "Core Web Vitals",
    lcp: "Largest Contentful Paint",
    fcp: "First Contentful Paint",
    cls: "Cumulative Layout Shift",
    seo: "SEO",
    accessibility: "Accessibility",
    failed_checks: "Failed checks",
    all_passed: "All checks passed",
    screenshots: "Screenshots",
    desktop: "Desktop",
    mobile: "Mobile",
    screenshots_unavailable: "Screenshots could not be captured",
    generated: "Generated",
};

const PT_BR: Labels = Labels {
    title: "Relatório de Auditoria de Performance",
    performance_score: "Pontuação de Performance",
    core_metrics: "Core Web Vitals",
    lcp: "Largest Contentful Paint",
    fcp: "First Contentful Paint",
    cls: "Cumulative Layout Shift",
    seo: "SEO",
    accessibility: "Acessibilidade",
    failed_checks: "Verificações reprovadas",
    all_passed: "Todas as verificações passaram",
    screenshots: "Capturas de tela",
    desktop: "Desktop",
    mobile: "Mobile",
    screenshots_unavailable: "Não foi possível capturar as telas",
    generated: "Gerado em",
};

const ES: Labels = Labels {
    title: "Informe de Auditoría de Rendimiento",
    performance_score: "Puntuación de Rendimiento",
    core_metrics: "Core Web Vitals",
    lcp: "Largest Contentful Paint",
    fcp: "First Contentful Paint",
    cls: "Cumulative Layout Shift",
    seo: "SEO",
    accessibility: "Accesibilidad",
    failed_checks: "Comprobaciones fallidas",
    all_passed: "Todas las comprobaciones superadas",
    screenshots: "Capturas de pantalla",
    desktop: "Escritorio",
    mobile: "Móvil",
    screenshots_unavailable: "No se pudieron capturar las pantallas",
    generated: "Generado el",
};

fn labels(lang: Language) -> &'static Labels {
    match lang {
        Language::En => &EN,
        Language::PtBr => &PT_BR,
        Language::Es => &ES,
    }
}

fn html_lang(lang: Language) -> &'static str {
    match lang {
        Language::En => "en",
        Language::PtBr => "pt-BR",
        Language::Es => "es",
    }
}

const STYLE: &str = r#"
body { font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; color: #1a1a2e; margin: 0; }
header { border-bottom: 3px solid #1a1a2e; padding-bottom: 12px; margin-bottom: 24px; }
h1 { font-size: 22px; margin: 0 0 4px; }
h2 { font-size: 15px; margin: 24px 0 8px; border-bottom: 1px solid #ddd; padding-bottom: 4px; }
.target { font-size: 13px; color: #444; word-break: break-all; margin: 0; }
.meta { font-size: 11px; color: #888; margin: 4px 0 0; }
.score-ring { width: 110px; height: 110px; border-radius: 50%; border: 8px solid; display: flex; align-items: center; justify-content: center; font-size: 36px; font-weight: 700; margin: 0 auto; }
.score-caption { text-align: center; font-size: 12px; color: #666; margin-top: 6px; }
table { width: 100%; border-collapse: collapse; font-size: 12px; }
td, th { text-align: left; padding: 6px 8px; border-bottom: 1px solid #eee; }
td.value { font-weight: 600; text-align: right; }
.badge { display: inline-block; min-width: 34px; text-align: center; border-radius: 4px; color: #fff; font-weight: 700; font-size: 12px; padding: 3px 6px; }
ul.failed { font-size: 11px; color: #555; margin: 6px 0 0; padding-left: 18px; }
ul.failed b { color: #1a1a2e; }
.passed { font-size: 11px; color: #0cce6b; }
.shots { display: flex; gap: 12px; }
.shot { flex: 1; }
.shot img { width: 100%; border: 1px solid #ddd; border-radius: 4px; }
.shot p { font-size: 11px; color: #666; text-align: center; margin: 4px 0 0; }
.unavailable { font-size: 11px; color: #a33; }
footer { margin-top: 28px; font-size: 10px; color: #aaa; border-top: 1px solid #eee; padding-top: 8px; }
"#;

/// Build the complete report document. The score is validated by the
/// caller; rendering itself cannot fail.
pub fn render(audit: &Audit, bundle: &InsightBundle, score: Score, shots: &ScreenshotImages) -> String {
    let labels = labels(audit.lang);
    let generated = Utc::now().format("%Y-%m-%d %H:%M UTC");

    let mut html = String::with_capacity(8 * 1024);
    html.push_str("<!DOCTYPE html>\n");
    html.push_str(&format!("<html lang=\"{}\">\n", html_lang(audit.lang)));
    html.push_str(&format!(
        "<head><meta charset=\"utf-8\"><style>{STYLE}</style></head>\n<body>\n"
    ));

    html.push_str(&format!(
        "<header><h1>{}</h1><p class=\"target\">{}</p><p class=\"meta\">{} &middot; {} {}</p></header>\n",
        labels.title,
        escape(&audit.url),
        audit.strategy,
        labels.generated,
        generated,
    ));

    html.push_str(&format!(
        "<section><div class=\"score-ring\" style=\"border-color:{color};color:{color}\">{pct}</div>\
         <p class=\"score-caption\">{caption}</p></section>\n",
        color = color_hex(score.color()),
        pct = score.to_percentage(),
        caption = labels.performance_score,
    ));

    html.push_str(&format!("<h2>{}</h2>\n<table>\n", labels.core_metrics));
    html.push_str(&metric_row(labels.lcp, bundle.lcp_display.as_deref()));
    html.push_str(&metric_row(labels.fcp, bundle.fcp_display.as_deref()));
    html.push_str(&metric_row(labels.cls, bundle.cls_display.as_deref()));
    html.push_str("</table>\n");

    html.push_str(&category_section(labels.seo, labels, &bundle.seo));
    html.push_str(&category_section(labels.accessibility, labels, &bundle.accessibility));

    html.push_str(&format!("<h2>{}</h2>\n", labels.screenshots));
    if shots.desktop.is_none() && shots.mobile.is_none() {
        html.push_str(&format!(
            "<p class=\"unavailable\">{}</p>\n",
            labels.screenshots_unavailable
        ));
        if let Some(error) = audit.screenshots.as_ref().and_then(|s| s.error.as_deref()) {
            html.push_str(&format!("<p class=\"unavailable\">{}</p>\n", escape(error)));
        }
    } else {
        html.push_str("<div class=\"shots\">\n");
        if let Some(uri) = &shots.desktop {
            html.push_str(&format!(
                "<div class=\"shot\"><img src=\"{uri}\" alt=\"\"><p>{}</p></div>\n",
                labels.desktop
            ));
        }
        if let Some(uri) = &shots.mobile {
            html.push_str(&format!(
                "<div class=\"shot\"><img src=\"{uri}\" alt=\"\"><p>{}</p></div>\n",
                labels.mobile
            ));
        }
        html.push_str("</div>\n");
    }

    html.push_str(&format!("<footer>{}</footer>\n", audit.id));
    html.push_str("</body>\n</html>\n");
    html
}

fn metric_row(label: &str, display: Option<&str>) -> String {
    let value = display
        .map(|d| MetricValue::from_display_value(d).format())
        .unwrap_or_else(|| "N/A".to_string());
    format!("<tr><td>{}</td><td class=\"value\">{}</td></tr>\n", label, value)
}

fn category_section(heading: &str, labels: &Labels, report: &CategoryReport) -> String {
    let (pct, color) = badge(report.score);
    let mut out = format!(
        "<h2>{heading} <span class=\"badge\" style=\"background:{color}\">{pct}</span></h2>\n"
    );
    if report.failed_audits.is_empty() {
        out.push_str(&format!("<p class=\"passed\">{}</p>\n", labels.all_passed));
    } else {
        out.push_str(&format!(
            "<p class=\"unavailable\">{}:</p>\n<ul class=\"failed\">\n",
            labels.failed_checks
        ));
        for failed in &report.failed_audits {
            out.push_str(&format!(
                "<li><b>{}</b> {}</li>\n",
                escape(&failed.title),
                escape(&failed.description)
            ));
        }
        out.push_str("</ul>\n");
    }
    out
}

/// Percentage and color for a raw 0..1 category score. NaN or junk from
/// upstream falls back to a gray zero rather than poisoning the report.
fn badge(value: f64) -> (i16, &'static str) {
    match Score::new(value.clamp(0.0, 1.0)) {
        Ok(score) => (score.to_percentage(), color_hex(score.color())),
        Err(_) => (0, "#9e9e9e"),
    }
}

fn color_hex(name: &str) -> &'static str {
    match name {
        "green" => "#0cce6b",
        "orange" => "#ffa400",
        _ => "#ff4e42",
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
