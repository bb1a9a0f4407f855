use fleet_core::types::{
    FileContent, GroupContent, ObjectContent, PackageContent, UserContent, Variable,
};
use fleet_renderer::{apply_templates, Interpolator, TemplateContext, DEFAULT_OWNER};
use rstest::rstest;

fn scope() -> TemplateContext {
    let mut ctx = TemplateContext::new();
    ctx.extend_from(&[Variable::new("env", "prod"), Variable::new("port", "8080")]);
    ctx.set_hostname("web1");
    ctx
}

fn file(path: &str, data: &str) -> FileContent {
    FileContent {
        path: path.to_string(),
        data: data.to_string(),
        mode: "644".to_string(),
        ..FileContent::default()
    }
}

// ---------------------------------------------------------------------------
// Interpolator
// ---------------------------------------------------------------------------

#[rstest]
#[case("listen {{port}};", "listen 8080;")]
#[case("{{hostname}}.{{env}}.example.com", "web1.prod.example.com")]
#[case("{{ env }}", "prod")]
#[case("no placeholders here", "no placeholders here")]
#[case("{{missing}} stays", "{{missing}} stays")]
#[case("{# jinja comment #} {% raw %}", "{# jinja comment #} {% raw %}")]
#[case("{{ not a key }}", "{{ not a key }}")]
#[case("{port}", "{port}")]
fn render_cases(#[case] template: &str, #[case] expected: &str) {
    assert_eq!(Interpolator::render(template, &scope()), expected);
}

#[test]
fn values_are_not_rescanned() {
    let mut ctx = TemplateContext::new();
    ctx.insert("a", "{{b}}");
    ctx.insert("b", "B");
    assert_eq!(Interpolator::render("{{a}}", &ctx), "{{b}}");
}

// ---------------------------------------------------------------------------
// Template step
// ---------------------------------------------------------------------------

#[test]
fn file_path_and_data_are_interpolated() {
    let out = apply_templates(
        ObjectContent::File(file("/etc/{{env}}/app.conf", "port={{port}}\n")),
        "app.conf",
        &scope(),
    );
    match out {
        ObjectContent::File(f) => {
            assert_eq!(f.path, "/etc/prod/app.conf");
            assert_eq!(f.data, "port=8080\n");
            assert_eq!(f.mode, "644");
        }
        other => panic!("unexpected content: {other:?}"),
    }
}

#[rstest]
#[case(None, "", "", DEFAULT_OWNER, DEFAULT_OWNER)]
#[case(Some("alice"), "", "", "alice", "alice")]
#[case(Some("alice"), "www-data", "", "www-data", "alice")]
#[case(None, "nginx", "adm", "nginx", "adm")]
fn file_owner_fallbacks(
    #[case] scope_user: Option<&str>,
    #[case] user: &str,
    #[case] group: &str,
    #[case] expected_user: &str,
    #[case] expected_group: &str,
) {
    let mut ctx = scope();
    if let Some(u) = scope_user {
        ctx.set_user(u);
    }
    let content = FileContent {
        user: user.to_string(),
        group: group.to_string(),
        ..file("/home/x", "")
    };
    match apply_templates(ObjectContent::File(content), "x", &ctx) {
        ObjectContent::File(f) => {
            assert_eq!(f.user, expected_user);
            assert_eq!(f.group, expected_group);
        }
        other => panic!("unexpected content: {other:?}"),
    }
}

#[test]
fn user_login_name_is_unit_name() {
    let content = ObjectContent::User(UserContent {
        first_name: "Alice".to_string(),
        name: Some("stale".to_string()),
        ..UserContent::default()
    });
    match apply_templates(content, "alice", &scope()) {
        ObjectContent::User(u) => {
            assert_eq!(u.name.as_deref(), Some("alice"));
            assert_eq!(u.first_name, "Alice");
        }
        other => panic!("unexpected content: {other:?}"),
    }
}

#[test]
fn other_classes_pass_through() {
    let package = ObjectContent::Package(PackageContent {
        name: Some("{{env}}-tools".to_string()),
        depends: vec![],
    });
    assert_eq!(apply_templates(package.clone(), "tools", &scope()), package);

    let group = ObjectContent::Group(GroupContent::default());
    assert_eq!(apply_templates(group.clone(), "staff", &scope()), group);
}
