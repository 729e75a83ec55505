use std::sync::atomic::Ordering;

use super::*;
use crate::fake_browser::*;

fn reset_to(env: &mut BrowserEnv, start_url: &str) -> StepOutput {
    let file = task_file(start_url);
    env.reset(&ResetOptions {
        config_file: Some(file.path().to_path_buf()),
    })
    .unwrap()
}

#[test]
fn test_simple_form_click_submit() {
    let (mut env, _shared) = new_env();
    let first = reset_to(&mut env, "https://shop.example/signup");
    assert!(first.observation.text.contains("[3] button 'Submit'"));
    assert!(!first.info.popup);

    let submit_id = env
        .current_tree()
        .unwrap()
        .refs
        .iter()
        .find(|(_, r)| r.role == "button")
        .map(|(id, _)| *id)
        .unwrap();
    let output = env.step(&Action::click(submit_id)).unwrap();

    assert_eq!(output.reward, 1.0);
    assert_eq!(output.info.fail_error, "");
    assert!(!output.info.popup);
    assert!(output.info.iframe.is_empty());
    assert!(!output.terminated);
    assert!(!output.truncated);
    assert_eq!(output.info.xpaths_input.len(), 2);
}

#[test]
fn test_cookie_banner_modal_close() {
    let (mut env, _shared) = new_env();
    let first = reset_to(&mut env, "https://news.example/");
    assert!(first.info.popup);
    assert_eq!(first.info.closes_ele, vec![CLOSER.to_string()]);

    let outcome = env.modal_close(&first.info.closes_ele).unwrap();
    assert_eq!(outcome.closed_xpaths, vec![CLOSER.to_string()]);
    assert!(!outcome.output.info.popup);
    assert!(!outcome.output.observation.text.contains("dialog"));

    // already visited: not clicked again
    let again = env.modal_close(&first.info.closes_ele).unwrap();
    assert!(again.closed_xpaths.is_empty());
    assert_eq!(again.visited_xpaths, vec![CLOSER.to_string()]);
    assert_eq!(again.output.reward, 0.0);
}

#[test]
fn test_remove_popups_fallback() {
    let (mut env, _shared) = new_env();
    reset_to(&mut env, "https://news.example/");
    let output = env.remove_popups().unwrap();
    assert_eq!(output.reward, 1.0);
    assert!(!output.info.popup);

    let nothing_left = env.remove_popups().unwrap();
    assert_eq!(nothing_left.reward, 0.0);
    assert!(!nothing_left.info.fail_error.is_empty());
}

#[test]
fn test_unresolvable_element_id_is_recoverable() {
    let (mut env, _shared) = new_env();
    reset_to(&mut env, "https://shop.example/signup");
    let action = Action::parse("click [9999]").unwrap();
    let output = env.step(&action).unwrap();

    assert_eq!(output.reward, 0.0);
    assert!(output.info.fail_error.contains("9999"));
    assert_eq!(output.info.page.url, "https://shop.example/signup");
}

#[test]
fn test_dialog_probe_failure_degrades() {
    let (mut env, shared) = new_env();
    shared.dialog_probe_fails.store(true, Ordering::SeqCst);
    reset_to(&mut env, "https://news.example/");
    let output = env.step(&Action::scroll(crate::actions::ScrollDirection::Down)).unwrap();

    assert!(!output.info.popup);
    assert_eq!(output.reward, 1.0);
    // the other probes still ran
    assert_eq!(output.info.closes_ele, vec![CLOSER.to_string()]);
}

#[test]
fn test_step_before_reset() {
    let (mut env, _shared) = new_env();
    let err = env.step(&Action::go_back()).unwrap_err();
    assert!(matches!(err, EnvError::NotReady));
}

#[test]
fn test_missing_config_file_is_fatal() {
    let (mut env, shared) = new_env();
    let err = env
        .reset(&ResetOptions {
            config_file: Some(PathBuf::from("/nonexistent/task.json")),
        })
        .unwrap_err();
    assert!(matches!(err, EnvError::ConfigNotFound(_)));
    assert_eq!(shared.launches.load(Ordering::SeqCst), 0);
    assert!(!env.is_ready());
}

#[test]
fn test_multiple_start_urls_open_tabs() {
    let (mut env, shared) = new_env();
    let output = reset_to(
        &mut env,
        "https://shop.example/signup |AND| https://news.example/",
    );
    assert_eq!(shared.pages.lock().unwrap().len(), 2);
    assert!(
        output
            .observation
            .text
            .starts_with("Tab 0 (current): Sign up\t\tTab 1: News")
    );
    assert_eq!(output.info.page.url, "https://shop.example/signup");
}

#[test]
fn test_new_tab_from_page_becomes_current() {
    let (mut env, _shared) = new_env();
    reset_to(&mut env, "https://popup.example/");
    let output = env.step(&Action::click(1)).unwrap();

    assert_eq!(output.reward, 1.0);
    assert_eq!(output.info.page.url, "https://shop.example/signup");
    assert!(output.observation.text.starts_with("Tab 0: Popup\t\tTab 1 (current): Sign up"));
}

#[test]
fn test_tab_focus_and_page_close() {
    let (mut env, shared) = new_env();
    reset_to(
        &mut env,
        "https://shop.example/signup |AND| https://news.example/",
    );

    let focused = env.step(&Action::tab_focus(1)).unwrap();
    assert_eq!(focused.info.page.url, "https://news.example/");

    let closed = env.step(&Action::page_close()).unwrap();
    assert_eq!(closed.reward, 1.0);
    assert_eq!(closed.info.page.url, "https://shop.example/signup");
    assert_eq!(shared.pages.lock().unwrap().len(), 1);

    let missing = env.step(&Action::tab_focus(5)).unwrap();
    assert_eq!(missing.reward, 0.0);
}

#[test]
fn test_click_by_link_text_navigates() {
    let (mut env, _shared) = new_env();
    reset_to(&mut env, "https://shop.example/signup");
    let output = env.step(&Action::click_link("Privacy Policy")).unwrap();

    assert_eq!(output.reward, 1.0);
    assert_eq!(output.info.page.url, "https://shop.example/privacy");
    // the privacy page itself has no links
    assert!(output.info.text_url_pairs.is_empty());
}

#[test]
fn test_link_map_follows_current_page() {
    let (mut env, _shared) = new_env();
    let first = reset_to(&mut env, "https://shop.example/signup");
    assert_eq!(
        first.info.text_url_pairs.get("privacy policy").map(String::as_str),
        Some("https://shop.example/privacy")
    );

    let moved = env.step(&Action::navigate("https://news.example/")).unwrap();
    assert_eq!(moved.info.page.url, "https://news.example/");
    assert!(moved.info.text_url_pairs.is_empty());

    let back = env.step(&Action::navigate("https://shop.example/signup")).unwrap();
    let outcome = env.modal_close(&[CLOSER.to_string()]).unwrap();
    assert_eq!(back.info.text_url_pairs, outcome.output.info.text_url_pairs);
    assert_eq!(env.remove_popups().unwrap().info.text_url_pairs.len(), 1);
}

#[test]
fn test_form_iframe_found_behind_ad_frames() {
    let (mut env, shared) = new_env();
    let first = reset_to(&mut env, "https://ads.example/");

    let urls: Vec<&str> = first.info.iframe.iter().map(|f| f.url.as_str()).collect();
    assert_eq!(urls, vec!["https://shop.example/signup"]);
    assert_eq!(first.info.page.url, "https://ads.example/");
    assert_eq!(shared.pages.lock().unwrap().len(), 1);

    let output = env.step(&Action::scroll(crate::actions::ScrollDirection::Down)).unwrap();
    assert_eq!(output.reward, 1.0);
    assert_eq!(output.info.iframe.len(), 1);
    assert!(output.observation.text.starts_with("Tab 0 (current): Ads"));
}

#[test]
fn test_iframe_limit_from_config() {
    let shared = std::sync::Arc::new(Shared::default());
    let launcher = FakeLauncher {
        shared: std::sync::Arc::clone(&shared),
    };
    let config = EnvConfig {
        max_iframes_per_step: 0,
        ..test_config()
    };
    let mut env = BrowserEnv::new(Box::new(launcher), config);
    let first = reset_to(&mut env, "https://ads.example/");

    assert!(first.info.iframe.is_empty());
    // only the page tab was ever opened
    assert_eq!(shared.next_id.load(Ordering::SeqCst), 1);
}

#[test]
fn test_tab_listing_failure_still_returns_output() {
    let (mut env, shared) = new_env();
    reset_to(&mut env, "https://shop.example/signup");
    shared.pages_fail.store(true, Ordering::SeqCst);

    let scrolled = env.step(&Action::scroll(crate::actions::ScrollDirection::Down)).unwrap();
    assert_eq!(scrolled.reward, 0.0);
    assert!(scrolled.info.fail_error.contains("tab refresh failed"));
    assert_eq!(scrolled.info.page.url, "https://shop.example/signup");
    assert!(scrolled.observation.text.contains("textbox 'Email'"));

    // the only tab goes away and no replacement can be found
    let closed = env.step(&Action::page_close()).unwrap();
    assert_eq!(closed.reward, 0.0);
    assert!(!closed.info.fail_error.is_empty());
    assert!(closed.observation.text.is_empty());
    assert!(env.current_tree().unwrap().refs.is_empty());

    let modal = env.modal_close(&[CLOSER.to_string()]).unwrap();
    assert!(modal.closed_xpaths.is_empty());
    assert_eq!(modal.output.reward, 0.0);
    assert!(!modal.output.info.fail_error.is_empty());

    let removed = env.remove_popups().unwrap();
    assert_eq!(removed.reward, 0.0);
    assert!(!removed.info.fail_error.is_empty());

    let after = env.step(&Action::go_back()).unwrap();
    assert!(!after.info.fail_error.is_empty());
    assert!(env.is_ready());
}

#[test]
fn test_type_into_textbox() {
    let (mut env, shared) = new_env();
    reset_to(&mut env, "https://shop.example/signup");
    let output = env
        .step(&Action::type_text(2, "user@example.com", true))
        .unwrap();

    assert_eq!(output.reward, 1.0);
    let page = shared.page(0);
    assert_eq!(*page.typed.lock().unwrap(), vec!["user@example.com".to_string()]);
}

#[test]
fn test_reset_rebuilds_session_and_close_is_final() {
    let (mut env, shared) = new_env();
    reset_to(&mut env, "https://news.example/");
    env.modal_close(&[CLOSER.to_string()]).unwrap();

    // a fresh session forgets visited closers
    let first = reset_to(&mut env, "https://news.example/");
    assert_eq!(shared.launches.load(Ordering::SeqCst), 2);
    let outcome = env.modal_close(&first.info.closes_ele).unwrap();
    assert_eq!(outcome.closed_xpaths.len(), 1);

    env.close();
    assert!(shared.closed.load(Ordering::SeqCst));
    assert!(matches!(env.step(&Action::go_back()), Err(EnvError::NotReady)));
    // closing twice is harmless
    env.close();
}
