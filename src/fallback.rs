use crate::errors::GenerationError;
use crate::executor::{BootstrapContext, snake_case};
use crate::model::{ComponentConfig, ComponentResult};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

/// Produces a component without any external toolchain.
#[async_trait]
pub trait FallbackGenerator: Send + Sync {
    async fn generate(
        &self,
        component: &ComponentConfig,
        ctx: &BootstrapContext,
    ) -> Result<ComponentResult, GenerationError>;

    fn supports_component(&self, component_type: &str) -> bool;

    fn default_flags(&self, _component_type: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Writes a minimal, buildable project skeleton from built-in templates.
#[derive(Debug, Default)]
pub struct SkeletonGenerator;

pub const SKELETON_TYPES: [&str; 6] = ["android", "flutter", "go-backend", "ios", "nextjs", "react"];

impl SkeletonGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Relative paths and contents for a component, or `None` for an
    /// unsupported type.
    pub fn files_for(&self, component: &ComponentConfig, project: &str) -> Option<Vec<(PathBuf, String)>> {
        let name = component.name.as_str();
        let files = match component.component_type.as_str() {
            "go-backend" => go_backend(component.setting_str("module").unwrap_or(name)),
            "nextjs" => nextjs(name),
            "react" => react(name),
            "flutter" => flutter(&snake_case(name)),
            "android" => android(name, &snake_case(name)),
            "ios" => ios(name),
            _ => return None,
        };

        let mut files: Vec<(PathBuf, String)> = files
            .into_iter()
            .map(|(path, content)| (PathBuf::from(path), content))
            .collect();
        files.push((
            PathBuf::from("README.md"),
            format!(
                "# {name}\n\nPart of {project}. This {} component was generated from a built-in \
                 skeleton because its toolchain was not usable. Re-run generation once the \
                 toolchain is installed to get the full scaffold.\n",
                component.component_type
            ),
        ));
        Some(files)
    }
}

#[async_trait]
impl FallbackGenerator for SkeletonGenerator {
    async fn generate(
        &self,
        component: &ComponentConfig,
        ctx: &BootstrapContext,
    ) -> Result<ComponentResult, GenerationError> {
        let files = self.files_for(component, &ctx.project_name).ok_or_else(|| {
            GenerationError::invalid_config(format!(
                "no skeleton for component type '{}'",
                component.component_type
            ))
            .with_component(&component.name)
        })?;

        info!("Writing {} skeleton for '{}'", component.component_type, component.name);
        for (relative, content) in files {
            let path = ctx.target_dir.join(&relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    GenerationError::file_system(format!("cannot create {}", parent.display()), e)
                        .with_component(&component.name)
                })?;
            }
            tokio::fs::write(&path, content).await.map_err(|e| {
                GenerationError::file_system(format!("cannot write {}", path.display()), e)
                    .with_component(&component.name)
            })?;
            debug!("Wrote {}", path.display());
        }

        Ok(ComponentResult::succeeded(component, ctx.target_dir.clone(), true))
    }

    fn supports_component(&self, component_type: &str) -> bool {
        SKELETON_TYPES.contains(&component_type)
    }
}

fn go_backend(module: &str) -> Vec<(&'static str, String)> {
    vec![
        ("go.mod", format!("module {module}\n\ngo 1.21\n")),
        (
            "main.go",
            r#"package main

import (
	"log"
	"net/http"
)

func main() {
	http.HandleFunc("/health", func(w http.ResponseWriter, r *http.Request) {
		w.Write([]byte("ok"))
	})
	log.Println("listening on :8080")
	log.Fatal(http.ListenAndServe(":8080", nil))
}
"#
            .to_string(),
        ),
    ]
}

fn nextjs(name: &str) -> Vec<(&'static str, String)> {
    vec![
        (
            "package.json",
            format!(
                r#"{{
  "name": "{name}",
  "private": true,
  "scripts": {{
    "dev": "next dev",
    "build": "next build",
    "start": "next start"
  }},
  "dependencies": {{
    "next": "^14.0.0",
    "react": "^18.2.0",
    "react-dom": "^18.2.0"
  }}
}}
"#
            ),
        ),
        (
            "app/layout.tsx",
            r#"export default function RootLayout({ children }: { children: React.ReactNode }) {
  return (
    <html lang="en">
      <body>{children}</body>
    </html>
  );
}
"#
            .to_string(),
        ),
        (
            "app/page.tsx",
            format!(
                r#"export default function Home() {{
  return <main>{name}</main>;
}}
"#
            ),
        ),
    ]
}

fn react(name: &str) -> Vec<(&'static str, String)> {
    vec![
        (
            "package.json",
            format!(
                r#"{{
  "name": "{name}",
  "private": true,
  "type": "module",
  "scripts": {{
    "dev": "vite",
    "build": "vite build"
  }},
  "dependencies": {{
    "react": "^18.2.0",
    "react-dom": "^18.2.0"
  }},
  "devDependencies": {{
    "@vitejs/plugin-react": "^4.0.0",
    "vite": "^5.0.0"
  }}
}}
"#
            ),
        ),
        (
            "index.html",
            format!(
                r#"<!doctype html>
<html lang="en">
  <head><title>{name}</title></head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.tsx"></script>
  </body>
</html>
"#
            ),
        ),
        (
            "src/main.tsx",
            r#"import React from "react";
import ReactDOM from "react-dom/client";
import App from "./App";

ReactDOM.createRoot(document.getElementById("root")!).render(<App />);
"#
            .to_string(),
        ),
        (
            "src/App.tsx",
            format!(
                r#"export default function App() {{
  return <h1>{name}</h1>;
}}
"#
            ),
        ),
    ]
}

fn flutter(package: &str) -> Vec<(&'static str, String)> {
    vec![
        (
            "pubspec.yaml",
            format!(
                r#"name: {package}
publish_to: none
version: 0.1.0

environment:
  sdk: ">=3.0.0 <4.0.0"

dependencies:
  flutter:
    sdk: flutter
"#
            ),
        ),
        (
            "lib/main.dart",
            format!(
                r#"import 'package:flutter/material.dart';

void main() => runApp(const MaterialApp(home: Scaffold(body: Center(child: Text('{package}')))));
"#
            ),
        ),
    ]
}

fn android(name: &str, package: &str) -> Vec<(&'static str, String)> {
    vec![
        ("settings.gradle.kts", format!("rootProject.name = \"{name}\"\ninclude(\":app\")\n")),
        (
            "build.gradle.kts",
            r#"plugins {
    id("com.android.application") version "8.2.0" apply false
    id("org.jetbrains.kotlin.android") version "1.9.20" apply false
}
"#
            .to_string(),
        ),
        (
            "app/build.gradle.kts",
            format!(
                r#"plugins {{
    id("com.android.application")
    id("org.jetbrains.kotlin.android")
}}

android {{
    namespace = "com.example.{package}"
    compileSdk = 34
    defaultConfig {{
        applicationId = "com.example.{package}"
        minSdk = 24
        targetSdk = 34
    }}
}}
"#
            ),
        ),
        (
            "app/src/main/AndroidManifest.xml",
            r#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android">
    <application android:label="@string/app_name">
        <activity android:name=".MainActivity" android:exported="true">
            <intent-filter>
                <action android:name="android.intent.action.MAIN" />
                <category android:name="android.intent.category.LAUNCHER" />
            </intent-filter>
        </activity>
    </application>
</manifest>
"#
            .to_string(),
        ),
        (
            "app/src/main/res/values/strings.xml",
            format!("<resources>\n    <string name=\"app_name\">{name}</string>\n</resources>\n"),
        ),
        (
            "app/src/main/java/MainActivity.kt",
            format!(
                r#"package com.example.{package}

import android.app.Activity

class MainActivity : Activity()
"#
            ),
        ),
    ]
}

fn ios(name: &str) -> Vec<(&'static str, String)> {
    vec![
        (
            "project.yml",
            format!(
                r#"name: {name}
targets:
  {name}:
    type: application
    platform: iOS
    deploymentTarget: "16.0"
    sources: [Sources]
"#
            ),
        ),
        (
            "Sources/App.swift",
            format!(
                r#"import SwiftUI

@main
struct MainApp: App {{
    var body: some Scene {{
        WindowGroup {{ Text("{name}") }}
    }}
}}
"#
            ),
        ),
    ]
}
