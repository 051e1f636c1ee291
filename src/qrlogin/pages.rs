use minijinja::{Environment, context};

use crate::error::AppResult;

const RESULT_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
	<meta charset="UTF-8">
	<meta name="viewport" content="width=device-width, initial-scale=1.0">
	<title>{{ title }}</title>
	<style>
		body {
			font-family: Arial, sans-serif;
			display: flex;
			justify-content: center;
			align-items: center;
			height: 100vh;
			margin: 0;
			background: {{ background }};
			color: white;
		}
		.container { text-align: center; padding: 20px; }
		h1 { font-size: 48px; margin: 0 0 20px 0; }
		p { font-size: 18px; margin: 0; }
		.detail { font-size: 14px; margin-top: 10px; }
	</style>
</head>
<body>
	<div class="container">
		<h1>{{ mark }}</h1>
		<p>{{ title }}</p>
		<p class="detail">{{ message }}</p>
	</div>
</body>
</html>"#;

fn render(title: &str, message: &str, ok: bool) -> AppResult<String> {
    let mut env = Environment::new();
    env.add_template("result.html", RESULT_PAGE)?;

    let (mark, background) = if ok {
        ("✓", "linear-gradient(135deg, #667eea 0%, #764ba2 100%)")
    } else {
        ("✗", "linear-gradient(135deg, #f5576c 0%, #f093fb 100%)")
    };

    let html = env.get_template("result.html")?.render(context! {
        title => title,
        message => message,
        mark => mark,
        background => background,
    })?;
    Ok(html)
}

/// Terminal page shown on the phone after a completed scan
pub fn success_page(title: &str, message: &str) -> AppResult<String> {
    render(title, message, true)
}

pub fn failure_page(title: &str, message: &str) -> AppResult<String> {
    render(title, message, false)
}
