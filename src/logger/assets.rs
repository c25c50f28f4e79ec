//! Viewer page and HTTP routing for the log server.
//!
//! The viewer is a single HTML page. It opens a WebSocket to the URL
//! substituted for `{{WS_URL}}` and renders every JSON record it receives.

// ============================================================================
// Imports
// ============================================================================

use crate::protocol::{HttpRequest, HttpResponse};

// ============================================================================
// Constants
// ============================================================================

/// Placeholder replaced by the WebSocket URL.
pub const WS_URL_PLACEHOLDER: &str = "{{WS_URL}}";

// ============================================================================
// Public Functions
// ============================================================================

/// Substitutes every `{{WS_URL}}` in `template` with `ws_url`.
#[must_use]
pub fn render_viewer(template: &str, ws_url: &str) -> String {
    template.replace(WS_URL_PLACEHOLDER, ws_url)
}

/// Answers a plain HTTP request.
///
/// `GET /` returns the rendered viewer page; anything else is a `404`.
#[must_use]
pub fn route(request: &HttpRequest, page: &str) -> HttpResponse {
    if request.method == "GET" && request.path() == "/" {
        HttpResponse::html(page)
    } else {
        HttpResponse::not_found()
    }
}

// ============================================================================
// Viewer Template
// ============================================================================

/// HTML for the log viewer.
pub const VIEWER_HTML_TEMPLATE: &str = r##"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>Log Viewer</title>
    <style>
        body {
            background: #1a1a2e;
            color: #ccc;
            font-family: monospace;
            margin: 0;
            line-height: 1.5;
        }
        header {
            position: sticky;
            top: 0;
            display: flex;
            gap: 12px;
            align-items: center;
            padding: 10px 16px;
            background: #16213e;
            border-bottom: 1px dashed #333;
        }
        h1 { color: #e94560; font-size: 16px; margin: 0; }
        #status { color: #888; }
        #status.open { color: #4ade80; }
        input, select, button {
            background: #0f3460;
            color: #fff;
            border: 1px solid #333;
            font-family: inherit;
            padding: 2px 6px;
        }
        #logs { padding: 8px 16px; }
        .row { white-space: pre-wrap; word-break: break-all; }
        .time { color: #666; }
        .loc { color: #555; }
        .error { color: #f87171; }
        .warn { color: #fbbf24; }
        .info { color: #fff; }
        .debug { color: #60a5fa; }
        .verbose, .unknown { color: #888; }
    </style>
</head>
<body>
    <header>
        <h1>Log Viewer</h1>
        <span id="status">connecting</span>
        <select id="level">
            <option value="31">all</option>
            <option value="15">debug+</option>
            <option value="7">info+</option>
            <option value="3">warn+</option>
            <option value="1">error</option>
        </select>
        <input id="filter" placeholder="filter">
        <button id="clear">clear</button>
    </header>
    <div id="logs"></div>
    <script>
        const wsUrl = "{{WS_URL}}";
        const logs = document.getElementById("logs");
        const status = document.getElementById("status");
        const level = document.getElementById("level");
        const filter = document.getElementById("filter");
        document.getElementById("clear").onclick = () => { logs.textContent = ""; };

        function visible(row) {
            const mask = Number(level.value);
            const text = filter.value.toLowerCase();
            return (Number(row.dataset.level) & mask) !== 0
                && (!text || row.textContent.toLowerCase().includes(text));
        }

        function refilter() {
            for (const row of logs.children) {
                row.style.display = visible(row) ? "" : "none";
            }
        }
        level.onchange = refilter;
        filter.oninput = refilter;

        function append(record) {
            const row = document.createElement("div");
            row.className = "row " + record.levelName;
            row.dataset.level = record.level;

            const time = document.createElement("span");
            time.className = "time";
            time.textContent = record.timeString + " ";
            const loc = document.createElement("span");
            loc.className = "loc";
            loc.textContent = record.file ? " (" + record.file + ":" + record.line + ")" : "";

            row.append(time, record.message, loc);
            row.style.display = visible(row) ? "" : "none";

            const atBottom = window.innerHeight + window.scrollY >= document.body.scrollHeight - 4;
            logs.appendChild(row);
            if (atBottom) {
                window.scrollTo(0, document.body.scrollHeight);
            }
        }

        function connect() {
            const ws = new WebSocket(wsUrl);
            ws.onopen = () => { status.textContent = wsUrl; status.className = "open"; };
            ws.onmessage = (event) => {
                try { append(JSON.parse(event.data)); } catch (e) { console.warn(e); }
            };
            ws.onclose = () => {
                status.textContent = "disconnected, retrying";
                status.className = "";
                setTimeout(connect, 1000);
            };
        }
        connect();
    </script>
</body>
</html>"##;

// ============================================================================
// Tests
// ============================================================================
