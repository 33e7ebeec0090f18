/// Render the home page: a drop-zone uploader, the live caption panel,
/// and the most recently retained images. Clients keep the image list
/// fresh over `/stream` and ask `/predict` for a caption per upload.
pub fn render_home(image_srcs: &[String]) -> String {
    let mut images = String::new();
    for src in image_srcs {
        images.push_str(&format!(
            "<div class=\"card\"><img alt=\"User uploaded image\" src=\"{src}\" /></div>\n"
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Image Caption Stream</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: #f4f5fb;
            margin: 0;
            padding: 24px;
        }}
        .container {{
            max-width: 720px;
            margin: 0 auto;
        }}
        h1 {{ color: #333; }}
        #drop {{
            border: 3px dashed #667eea;
            border-radius: 12px;
            background: #fff;
            padding: 48px 16px;
            text-align: center;
            color: #667eea;
            cursor: pointer;
        }}
        #drop.hover {{ background: #eef0ff; }}
        #status {{ margin: 12px 0; color: #666; }}
        #solution-container {{
            background: #fff;
            border-radius: 12px;
            padding: 16px;
            margin: 12px 0;
            min-height: 1.4em;
            color: #333;
        }}
        .card {{ background: #fff; border-radius: 12px; padding: 8px; margin: 12px 0; }}
        .card img {{ max-width: 100%; border-radius: 8px; }}
        .uploader {{ color: #999; font-size: 0.85em; margin-bottom: 4px; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Image Caption Stream</h1>
        <div id="drop">Drop an image here or click to select</div>
        <input type="file" id="file" accept="image/*" style="display:none">
        <div id="status">Select an image</div>
        <div id="solution-container"></div>
        <div id="images">
{images}
        </div>
    </div>
    <script>
        var drop = document.getElementById('drop');
        var fileInput = document.getElementById('file');
        var status = document.getElementById('status');
        var solution = document.getElementById('solution-container');
        var imageList = document.getElementById('images');

        function sse() {{
            var source = new EventSource('/stream');
            source.onmessage = function(e) {{
                if (e.data == '')
                    return;
                var data = JSON.parse(e.data);
                var container = document.createElement('div');
                container.className = 'card';
                var uploader = document.createElement('div');
                uploader.className = 'uploader';
                uploader.textContent = 'Image uploaded by ' + data.ip_addr;
                var image = document.createElement('img');
                image.alt = 'User uploaded image';
                image.src = data.src;
                container.appendChild(uploader);
                container.appendChild(image);
                imageList.prepend(container);
                predict(data.src);
            }};
        }}

        function predict(src) {{
            solution.textContent = 'Captioning…';
            fetch('/predict', {{
                method: 'POST',
                headers: {{'Content-Type': 'application/x-www-form-urlencoded'}},
                body: 'src=' + encodeURIComponent(src)
            }}).then(function(r) {{ return r.json(); }}).then(function(result) {{
                solution.textContent = result.error ? ('Error: ' + result.error) : result.solution;
            }}).catch(function() {{
                solution.textContent = 'Caption request failed';
            }});
        }}

        function upload(file) {{
            status.textContent = 'uploading image';
            fetch('/post', {{ method: 'POST', body: file }}).then(function(r) {{
                return r.text();
            }}).then(function(text) {{
                status.textContent = 'upload complete: ' + text;
            }}).catch(function() {{
                status.textContent = 'upload failed';
            }});
        }}

        drop.addEventListener('click', function() {{ fileInput.click(); }});
        drop.addEventListener('dragover', function(e) {{
            e.preventDefault();
            drop.className = 'hover';
        }});
        drop.addEventListener('dragleave', function() {{ drop.className = ''; }});
        drop.addEventListener('drop', function(e) {{
            e.preventDefault();
            drop.className = '';
            if (e.dataTransfer.files.length > 0)
                upload(e.dataTransfer.files[0]);
        }});
        fileInput.addEventListener('change', function(e) {{
            if (e.target.files.length > 0)
                upload(e.target.files[0]);
            e.target.value = '';
        }});

        sse();
    </script>
</body>
</html>
"#
    )
}
