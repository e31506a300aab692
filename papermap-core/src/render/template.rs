//! HTML template for the paper map.
//!
//! The page is a single file: inline CSS, an inline script drawing the points
//! on a canvas, and the [`MapDocument`] as a JSON block in
//! `<script type="application/json" id="paper-data">`. Every `<`, `>` and `&`
//! in that JSON is written as a `\u` escape so no string in the data can close
//! the script element.

use super::MapDocument;
use crate::error::{PapermapError, Result};
use handlebars::Handlebars;
use serde_json::json;

const DATA_OPEN: &str = r#"<script type="application/json" id="paper-data">"#;
const DATA_CLOSE: &str = "</script>";

const MAP_TEMPLATE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{{title}}</title>
<style>
  :root { --bg: #ffffff; --fg: #1f2328; --panel: rgba(246, 248, 250, 0.94); --muted: #57606a; }
  body.dark { --bg: #0d1117; --fg: #e6edf3; --panel: rgba(22, 27, 34, 0.94); --muted: #8b949e; }
  html, body { margin: 0; height: 100%; background: var(--bg); color: var(--fg); font-family: {{{font_family}}}; }
  #map { position: fixed; inset: 0; width: 100%; height: 100%; cursor: crosshair; }
  header { position: fixed; top: 12px; left: 16px; pointer-events: none; }
  header h1 { margin: 0; font-size: 20px; }
  header p { margin: 2px 0 0; color: var(--muted); font-size: 13px; }
  #controls { position: fixed; top: 12px; right: 16px; width: 260px; padding: 10px 12px; background: var(--panel); border-radius: 8px; font-size: 13px; }
  #controls input[type=search] { width: 100%; box-sizing: border-box; padding: 5px 8px; margin-bottom: 8px; }
  #controls input[type=range] { width: 100%; }
  #legend { max-height: 40vh; overflow-y: auto; margin-top: 8px; }
  #legend div { display: flex; align-items: center; gap: 6px; cursor: pointer; padding: 1px 0; }
  #legend div.off { opacity: 0.35; }
  #legend span.swatch { width: 10px; height: 10px; border-radius: 50%; flex: none; }
  #stats { margin-top: 6px; color: var(--muted); }
  #tooltip { position: fixed; display: none; max-width: 360px; padding: 8px 10px; background: var(--panel); border-radius: 6px; font-size: 12px; pointer-events: none; box-shadow: 0 2px 8px rgba(0, 0, 0, 0.3); }
  #tooltip .t { font-weight: bold; margin-bottom: 4px; }
  #tooltip .m { color: var(--muted); margin-bottom: 4px; }
</style>
</head>
<body{{#if dark_mode}} class="dark"{{/if}}>
<canvas id="map"></canvas>
<header>
  <h1>{{title}}</h1>
  <p>{{subtitle}}</p>
</header>
<div id="controls">
  {{#if enable_search}}<input id="search" type="search" placeholder="Search titles and authors" autocomplete="off">{{/if}}
  <label for="year">Papers up to <span id="year-label">{{year_max}}</span></label>
  <input id="year" type="range" min="{{year_min}}" max="{{year_max}}" value="{{year_max}}" step="1">
  <div id="stats"></div>
  <div id="legend"></div>
</div>
<div id="tooltip"></div>
{{{data_block}}}
<script>
(function () {
  "use strict";
  const doc = JSON.parse(document.getElementById("paper-data").textContent);
  const cfg = doc.config;
  const points = doc.points;
  const canvas = document.getElementById("map");
  const ctx = canvas.getContext("2d");
  const tooltip = document.getElementById("tooltip");
  const stats = document.getElementById("stats");
  const legend = document.getElementById("legend");
  const slider = document.getElementById("year");
  const yearLabel = document.getElementById("year-label");
  const search = document.getElementById("search");

  const hidden = new Set();
  let query = "";
  let maxYear = doc.year_max;
  let zoom = 1, panX = 0, panY = 0;
  let screen = [];

  const xs = points.map(function (p) { return p.x; });
  const ys = points.map(function (p) { return p.y; });
  const minX = Math.min.apply(null, xs.concat([0])), maxX = Math.max.apply(null, xs.concat([1]));
  const minY = Math.min.apply(null, ys.concat([0])), maxY = Math.max.apply(null, ys.concat([1]));

  function isVisible(p) {
    return p.year <= maxYear && !hidden.has(p.category) &&
      (query === "" || p.search_title.indexOf(query) !== -1 ||
        p.search_authors.indexOf(query) !== -1);
  }

  function toScreen(p) {
    const pad = 60;
    const w = canvas.width - 2 * pad, h = canvas.height - 2 * pad;
    const s = Math.min(w / ((maxX - minX) || 1), h / ((maxY - minY) || 1)) * zoom;
    const cx = canvas.width / 2 + panX, cy = canvas.height / 2 + panY;
    return [cx + (p.x - (minX + maxX) / 2) * s, cy - (p.y - (minY + maxY) / 2) * s];
  }

  function draw() {
    ctx.clearRect(0, 0, canvas.width, canvas.height);
    screen = [];
    let shown = 0;
    for (const p of points) {
      if (!isVisible(p)) continue;
      const xy = toScreen(p);
      const r = p.size * window.devicePixelRatio / 2;
      ctx.beginPath();
      ctx.arc(xy[0], xy[1], r, 0, 2 * Math.PI);
      ctx.fillStyle = p.color;
      ctx.globalAlpha = 0.8;
      ctx.fill();
      screen.push([xy[0], xy[1], r, p]);
      shown += 1;
    }
    ctx.globalAlpha = 1;
    stats.textContent = shown + " of " + points.length + " papers shown";
  }

  function resize() {
    canvas.width = window.innerWidth * window.devicePixelRatio;
    canvas.height = window.innerHeight * window.devicePixelRatio;
    draw();
  }

  function hit(evt) {
    const mx = evt.clientX * window.devicePixelRatio, my = evt.clientY * window.devicePixelRatio;
    let best = null, bestD = Infinity;
    for (const s of screen) {
      const d = Math.hypot(s[0] - mx, s[1] - my);
      if (d <= Math.max(s[2], 4 * window.devicePixelRatio) && d < bestD) {
        best = s[3];
        bestD = d;
      }
    }
    return best;
  }

  function line(cls, text) {
    const el = document.createElement("div");
    if (cls) el.className = cls;
    el.textContent = text;
    return el;
  }

  function showTooltip(p, evt) {
    tooltip.replaceChildren();
    tooltip.appendChild(line("t", p.title));
    if (p.authors) tooltip.appendChild(line("m", p.authors));
    const where = [p.year_known ? String(p.year) : "Year unknown", p.category];
    if (p.cluster_label) where.push(p.cluster_label);
    if (p.citations !== null) where.push(p.citations + " citations");
    tooltip.appendChild(line("m", where.join(" · ")));
    if (p.abstract_snippet) tooltip.appendChild(line("", p.abstract_snippet));
    tooltip.style.left = Math.min(evt.clientX + 14, window.innerWidth - 380) + "px";
    tooltip.style.top = (evt.clientY + 14) + "px";
    tooltip.style.display = "block";
  }

  function openLink(p) {
    if (!p || !p.link) return;
    if (cfg.click_action === "new_tab") {
      window.open(p.link, "_blank", "noopener");
    } else if (cfg.click_action === "same_tab") {
      window.location.href = p.link;
    }
  }

  function buildLegend() {
    for (const c of doc.categories) {
      const row = document.createElement("div");
      const swatch = document.createElement("span");
      swatch.className = "swatch";
      swatch.style.background = c.color;
      row.appendChild(swatch);
      row.appendChild(document.createTextNode(c.name + " (" + c.count + ")"));
      row.addEventListener("click", function () {
        if (hidden.has(c.name)) hidden.delete(c.name); else hidden.add(c.name);
        row.classList.toggle("off");
        draw();
      });
      legend.appendChild(row);
    }
  }

  let drag = null;
  canvas.addEventListener("mousedown", function (evt) { drag = [evt.clientX, evt.clientY, false]; });
  window.addEventListener("mouseup", function () { setTimeout(function () { drag = null; }, 0); });
  canvas.addEventListener("mousemove", function (evt) {
    if (drag && evt.buttons === 1) {
      panX += (evt.clientX - drag[0]) * window.devicePixelRatio;
      panY += (evt.clientY - drag[1]) * window.devicePixelRatio;
      drag = [evt.clientX, evt.clientY, true];
      tooltip.style.display = "none";
      draw();
      return;
    }
    const p = hit(evt);
    canvas.style.cursor = p && p.link && cfg.click_action !== "disabled" ? "pointer" : "crosshair";
    if (p) showTooltip(p, evt); else tooltip.style.display = "none";
  });
  canvas.addEventListener("mouseleave", function () { tooltip.style.display = "none"; });
  canvas.addEventListener("click", function (evt) {
    if (drag && drag[2]) return;
    openLink(hit(evt));
  });
  canvas.addEventListener("wheel", function (evt) {
    evt.preventDefault();
    zoom = Math.min(40, Math.max(0.5, zoom * (evt.deltaY < 0 ? 1.15 : 1 / 1.15)));
    draw();
  }, { passive: false });

  if (search) {
    search.addEventListener("input", function () {
      query = search.value.trim().toLowerCase();
      draw();
    });
  }
  slider.addEventListener("input", function () {
    maxYear = Number(slider.value);
    yearLabel.textContent = slider.value;
    draw();
  });
  window.addEventListener("resize", resize);

  buildLegend();
  resize();
})();
</script>
</body>
</html>
"##;

/// Serialize the document as an inert JSON script block.
fn data_block(doc: &MapDocument) -> Result<String> {
    let json = serde_json::to_string(doc)?
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026");
    Ok(format!("{DATA_OPEN}{json}{DATA_CLOSE}"))
}

/// Check a CSS `font-family` value before it goes into the page unescaped.
///
/// Only family names, quotes, commas, dots and hyphens are allowed, so the
/// value cannot end the declaration or the `<style>` element.
fn css_font_family(value: &str) -> Result<&str> {
    let allowed = |c: char| c.is_alphanumeric() || " ,-_.'\"".contains(c);
    if value.trim().is_empty() || !value.chars().all(allowed) {
        return Err(PapermapError::render(format!(
            "unsupported font_family '{value}'"
        )));
    }
    Ok(value)
}

/// Render the self-contained HTML page for `doc`.
pub fn render_html(doc: &MapDocument) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(false);

    let vars = json!({
        "title": doc.title,
        "subtitle": doc.subtitle,
        "font_family": css_font_family(&doc.config.font_family)?,
        "dark_mode": doc.config.dark_mode,
        "enable_search": doc.config.enable_search,
        "year_min": doc.year_min,
        "year_max": doc.year_max,
        "data_block": data_block(doc)?,
    });
    Ok(handlebars.render_template(MAP_TEMPLATE, &vars)?)
}

/// Recover the embedded [`MapDocument`] from a rendered page.
pub fn extract_document(html: &str) -> Result<MapDocument> {
    let start = html
        .find(DATA_OPEN)
        .map(|i| i + DATA_OPEN.len())
        .ok_or_else(|| PapermapError::render("no paper-data block in page"))?;
    let len = html[start..]
        .find(DATA_CLOSE)
        .ok_or_else(|| PapermapError::render("unterminated paper-data block"))?;
    Ok(serde_json::from_str(&html[start..start + len])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{MapPoint, RenderConfig};

    fn point(id: &str, title: &str) -> MapPoint {
        MapPoint {
            id: id.into(),
            x: 1.0,
            y: -1.0,
            title: title.into(),
            label: title.into(),
            authors: "A. Author".into(),
            search_title: title.to_lowercase(),
            search_authors: "a. author".into(),
            year: 2020,
            year_known: true,
            category: "Systems".into(),
            cluster_id: Some(0),
            cluster_label: None,
            abstract_snippet: None,
            link: Some("https://drive.example/file?id=1&x=2".into()),
            citations: None,
            size: 5.0,
            color: "#4e79a7".into(),
        }
    }

    fn doc(points: Vec<MapPoint>) -> MapDocument {
        MapDocument {
            title: "Map <of> Papers".into(),
            subtitle: "2 papers across 1 research areas".into(),
            config: RenderConfig::default(),
            year_min: 2020,
            year_max: 2020,
            categories: Vec::new(),
            points,
        }
    }

    #[test]
    fn test_page_embeds_recoverable_document() {
        let d = doc(vec![point("a", "First"), point("b", "Second")]);
        let html = render_html(&d).unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<h1>Map &lt;of&gt; Papers</h1>"));
        assert!(html.contains(r#"<body class="dark">"#));
        assert!(html.contains(r#"id="search""#));
        assert_eq!(extract_document(&html).unwrap(), d);
    }

    #[test]
    fn test_script_breakout_is_escaped() {
        let d = doc(vec![point("a", "</script><script>alert(1)</script>")]);
        let html = render_html(&d).unwrap();
        assert_eq!(html.matches("</script>").count(), 2);
        let back = extract_document(&html).unwrap();
        assert_eq!(back.points[0].title, "</script><script>alert(1)</script>");
    }

    #[test]
    fn test_config_toggles_markup() {
        let mut d = doc(vec![point("a", "First")]);
        d.config.enable_search = false;
        d.config.dark_mode = false;
        let html = render_html(&d).unwrap();
        assert!(!html.contains(r#"id="search""#));
        assert!(html.contains("<body>"));
    }

    #[test]
    fn test_font_family_keeps_quotes() {
        let mut d = doc(vec![point("a", "First")]);
        d.config.font_family = r#""Inter", sans-serif"#.into();
        let html = render_html(&d).unwrap();
        assert!(html.contains(r#"font-family: "Inter", sans-serif;"#));
        assert!(!html.contains("&quot;Inter"));
    }

    #[test]
    fn test_font_family_cannot_close_style() {
        let mut d = doc(vec![point("a", "First")]);
        for bad in ["serif; } body { display: none", "serif</style><script>", ""] {
            d.config.font_family = bad.into();
            let err = render_html(&d).unwrap_err();
            assert!(err.to_string().contains("font_family"));
        }
    }

    #[test]
    fn test_extract_rejects_foreign_html() {
        assert!(extract_document("<html></html>").is_err());
    }
}
