// agent/src/sys/render.rs
//
// Pure rendering of nginx virtual-host configuration. No side effects:
// identical inputs produce byte-identical output, which is what lets the
// update path diff/snapshot renderings and the tests assert shapes exactly.

use std::path::{Path, PathBuf};

/// Declarative inputs for one virtual host rendering.
#[derive(Debug, Clone)]
pub struct VhostTemplate<'a> {
    pub domain: &'a str,
    pub document_root: &'a Path,
    /// Owning OS account; selects the per-tenant PHP-FPM pool socket
    pub owner: &'a str,
    pub php_version: &'a str,
    pub tls_enabled: bool,
    /// Operator-supplied fragment, inserted verbatim (see `render`)
    pub custom_fragment: Option<&'a str>,
}

pub struct ConfigRenderer {
    cert_live_root: PathBuf,
    php_socket_dir: PathBuf,
}

impl ConfigRenderer {
    pub fn new(cert_live_root: PathBuf, php_socket_dir: PathBuf) -> Self {
        Self { cert_live_root, php_socket_dir }
    }

    /// Upstream socket for the tenant's PHP pool. One execution engine
    /// instance per OS account keeps tenants isolated from each other.
    pub fn php_socket_path(&self, owner: &str, php_version: &str) -> PathBuf {
        self.php_socket_dir
            .join(format!("php{}-fpm-{}.sock", php_version, owner))
    }

    /// Renders the full site definition.
    ///
    /// TLS off: one server block on port 80. TLS on: a 443 block plus a
    /// second block that 301-redirects HTTP to HTTPS.
    ///
    /// 🛡️ Trust boundary: `custom_fragment` is operator-supplied (panel
    /// admin, not tenant) and is included unsanitized: nginx's own grammar
    /// applies, and rewriting it here would silently change what operators
    /// can express. The self-test still gates anything malformed.
    pub fn render(&self, t: &VhostTemplate<'_>) -> String {
        let mut config = String::from("server {\n");

        if t.tls_enabled {
            let live_dir = self.cert_live_root.join(t.domain);
            config.push_str("    listen 443 ssl http2;\n");
            config.push_str("    listen [::]:443 ssl http2;\n");
            config.push_str(&format!(
                "    ssl_certificate {}/fullchain.pem;\n",
                live_dir.display()
            ));
            config.push_str(&format!(
                "    ssl_certificate_key {}/privkey.pem;\n",
                live_dir.display()
            ));
            config.push_str("    ssl_protocols TLSv1.2 TLSv1.3;\n");
            config.push_str(
                "    ssl_ciphers ECDHE-RSA-AES256-GCM-SHA512:DHE-RSA-AES256-GCM-SHA512:ECDHE-RSA-AES256-GCM-SHA384:DHE-RSA-AES256-GCM-SHA384;\n",
            );
            config.push_str("    ssl_prefer_server_ciphers off;\n");
        } else {
            config.push_str("    listen 80;\n");
            config.push_str("    listen [::]:80;\n");
        }

        config.push_str(&format!("    server_name {};\n", t.domain));
        config.push_str(&format!("    root {};\n", t.document_root.display()));
        config.push_str("    index index.php index.html index.htm;\n\n");

        config.push_str("    # Security headers\n");
        config.push_str("    add_header X-Frame-Options DENY;\n");
        config.push_str("    add_header X-Content-Type-Options nosniff;\n");
        config.push_str("    add_header X-XSS-Protection \"1; mode=block\";\n\n");

        config.push_str("    location / {\n");
        config.push_str("        try_files $uri $uri/ /index.php?$query_string;\n");
        config.push_str("    }\n\n");

        config.push_str("    location ~ \\.php$ {\n");
        config.push_str(&format!(
            "        fastcgi_pass unix:{};\n",
            self.php_socket_path(t.owner, t.php_version).display()
        ));
        config.push_str("        fastcgi_index index.php;\n");
        config.push_str("        fastcgi_param SCRIPT_FILENAME $realpath_root$fastcgi_script_name;\n");
        config.push_str("        include fastcgi_params;\n");
        config.push_str("    }\n\n");

        // Deny dotfile artifacts (.htaccess, .htpasswd) outright
        config.push_str("    location ~ /\\.ht {\n");
        config.push_str("        deny all;\n");
        config.push_str("    }\n\n");

        if let Some(fragment) = t.custom_fragment {
            config.push_str("    # Custom configuration\n");
            config.push_str(&format!("    {}\n\n", fragment));
        }

        config.push_str("}\n");

        if t.tls_enabled {
            config.push_str("\nserver {\n");
            config.push_str("    listen 80;\n");
            config.push_str("    listen [::]:80;\n");
            config.push_str(&format!("    server_name {};\n", t.domain));
            config.push_str("    return 301 https://$server_name$request_uri;\n");
            config.push_str("}\n");
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> ConfigRenderer {
        ConfigRenderer::new(
            PathBuf::from("/etc/letsencrypt/live"),
            PathBuf::from("/var/run/php"),
        )
    }

    fn template(tls: bool) -> VhostTemplate<'static> {
        VhostTemplate {
            domain: "example.com",
            document_root: Path::new("/home/alice/public_html"),
            owner: "alice",
            php_version: "8.3",
            tls_enabled: tls,
            custom_fragment: None,
        }
    }

    #[test]
    fn plain_http_has_one_block_and_no_tls_directives() {
        let config = renderer().render(&template(false));
        assert_eq!(config.matches("server {").count(), 1);
        assert!(config.contains("listen 80;"));
        assert!(!config.contains("ssl"));
        assert!(!config.contains("443"));
    }

    #[test]
    fn tls_renders_https_block_plus_redirect() {
        let config = renderer().render(&template(true));
        assert_eq!(config.matches("server {").count(), 2);
        assert!(config.contains("listen 443 ssl http2;"));
        assert!(config.contains("ssl_certificate /etc/letsencrypt/live/example.com/fullchain.pem;"));
        assert!(config.contains("ssl_certificate_key /etc/letsencrypt/live/example.com/privkey.pem;"));
        assert!(config.contains("return 301 https://$server_name$request_uri;"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let r = renderer();
        let t = template(true);
        assert_eq!(r.render(&t), r.render(&t));
        assert_eq!(r.render(&t), r.render(&t.clone()));
    }

    #[test]
    fn php_upstream_socket_is_derived_from_owner_and_version() {
        let config = renderer().render(&template(false));
        assert!(config.contains("fastcgi_pass unix:/var/run/php/php8.3-fpm-alice.sock;"));

        let other = VhostTemplate { owner: "bob", php_version: "8.1", ..template(false) };
        let config = renderer().render(&other);
        assert!(config.contains("fastcgi_pass unix:/var/run/php/php8.1-fpm-bob.sock;"));
    }

    #[test]
    fn security_headers_and_dotfile_deny_always_present() {
        for tls in [false, true] {
            let config = renderer().render(&template(tls));
            assert!(config.contains("add_header X-Frame-Options DENY;"));
            assert!(config.contains("add_header X-Content-Type-Options nosniff;"));
            assert!(config.contains("add_header X-XSS-Protection \"1; mode=block\";"));
            assert!(config.contains("location ~ /\\.ht {"));
        }
    }

    #[test]
    fn custom_fragment_is_included_verbatim() {
        let fragment = "location /downloads { autoindex on; }";
        let t = VhostTemplate { custom_fragment: Some(fragment), ..template(false) };
        let config = renderer().render(&t);
        assert!(config.contains(fragment));
        assert!(config.contains("# Custom configuration"));

        // Verbatim means verbatim: nothing is escaped or rewritten.
        let odd = "if ($host ~* \"^www\\.\") { return 302 $scheme://example.com$request_uri; }";
        let t = VhostTemplate { custom_fragment: Some(odd), ..template(false) };
        assert!(renderer().render(&t).contains(odd));
    }

    #[test]
    fn document_root_is_rendered_as_given() {
        let t = VhostTemplate {
            document_root: Path::new("/srv/sites/example"),
            ..template(false)
        };
        assert!(renderer().render(&t).contains("    root /srv/sites/example;\n"));
    }
}
