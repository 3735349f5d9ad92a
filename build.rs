use vergen::EmitBuilder;

fn main() {
    // 生成构建信息，命令行 --version 会带上构建时间和提交号
    EmitBuilder::builder()
        .build_timestamp()
        .git_sha(true)
        .emit()
        .expect("Failed to generate build information");
}
